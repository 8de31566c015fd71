//! Queued action envelopes.
//!
//! An envelope wraps an action payload with a client-generated id, a
//! secondary audit correlation id, a provisional timestamp and a checksum
//! over the canonical form of the payload. Payload and checksum never change
//! after the envelope is built; only `status` and the diagnostic fields move.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::QueueError;

/// Kind of offline-eligible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    SaleComplete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SaleComplete => "SALE_COMPLETE",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SALE_COMPLETE" => Ok(ActionType::SaleComplete),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// Local lifecycle of a queued action.
///
/// `Applied` and `Rejected` are terminal and remove the record; `Conflict`
/// and `Failed` stay queued with diagnostics until resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Applied,
    Rejected,
    Conflict,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::Applied => "APPLIED",
            ActionStatus::Rejected => "REJECTED",
            ActionStatus::Conflict => "CONFLICT",
            ActionStatus::Failed => "FAILED",
        }
    }

    /// Not yet terminally resolved; counted as pending sync work.
    pub fn is_unsettled(&self) -> bool {
        matches!(
            self,
            ActionStatus::Pending | ActionStatus::Conflict | ActionStatus::Failed
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ActionStatus::Pending),
            "APPLIED" => Ok(ActionStatus::Applied),
            "REJECTED" => Ok(ActionStatus::Rejected),
            "CONFLICT" => Ok(ActionStatus::Conflict),
            "FAILED" => Ok(ActionStatus::Failed),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// A single pending offline operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub action_type: ActionType,
    pub payload: Value,
    pub checksum: String,
    pub provisional_at: DateTime<Utc>,
    pub local_audit_id: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl QueuedAction {
    /// Build a fresh `Pending` envelope for `payload`.
    ///
    /// Only structure is checked here (the payload must be a JSON object);
    /// business rules are the server's concern.
    pub fn build(action_type: ActionType, payload: Value) -> Result<Self, QueueError> {
        if !payload.is_object() {
            return Err(QueueError::Malformed(format!(
                "{action_type} payload must be a JSON object"
            )));
        }
        let checksum = checksum(&payload);
        Ok(Self {
            id: new_id(),
            action_type,
            payload,
            checksum,
            provisional_at: Utc::now(),
            local_audit_id: new_id(),
            status: ActionStatus::Pending,
            conflict_reason: None,
            error_message: None,
        })
    }

    /// Record the server's verdict. Payload and checksum are untouched.
    pub fn mark(
        &mut self,
        status: ActionStatus,
        conflict_reason: Option<String>,
        error: Option<String>,
    ) {
        self.status = status;
        self.conflict_reason = conflict_reason;
        self.error_message = error;
    }
}

/// Collision-resistant identifier. UUID v4 comes from the OS RNG; no
/// time-based fallback is needed on the platforms this crate targets.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic digest of a payload, independent of key insertion order.
pub fn checksum(payload: &Value) -> String {
    let canonical = canonical_json(payload);
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Serialize `value` with object keys sorted recursively and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
