//! Wire types for the offline endpoints.
//!
//! `POST /api/offline/sync` carries the whole queue in one batch and answers
//! with one result per action plus an optional refreshed snapshot.
//! `POST /api/offline/status` is a fire-and-forget connectivity report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{ActionStatus, ActionType, QueuedAction};

/// One queued action as submitted to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActionItem {
    pub action_type: ActionType,
    pub payload: Value,
    pub checksum: String,
    pub provisional_at: DateTime<Utc>,
    pub local_audit_id: String,
}

impl From<&QueuedAction> for SyncActionItem {
    fn from(action: &QueuedAction) -> Self {
        Self {
            action_type: action.action_type,
            payload: action.payload.clone(),
            checksum: action.checksum.clone(),
            provisional_at: action.provisional_at,
            local_audit_id: action.local_audit_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    pub device_id: String,
    pub actions: Vec<SyncActionItem>,
}

/// Server-side outcome for one submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    Applied,
    Rejected,
    Conflict,
    Failed,
}

impl From<RemoteStatus> for ActionStatus {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Applied => ActionStatus::Applied,
            RemoteStatus::Rejected => ActionStatus::Rejected,
            RemoteStatus::Conflict => ActionStatus::Conflict,
            RemoteStatus::Failed => ActionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResultItem {
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_audit_id: Option<String>,
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Loosely typed per action type; decoded via `sale::ActionResult`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub results: Vec<SyncResultItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub device_id: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}
