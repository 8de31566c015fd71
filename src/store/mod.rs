//! Durable local store for the offline queue.
//!
//! Four logical collections: the action queue keyed by id, scalar flags,
//! named snapshot cache slots replaced atomically, and an append-only receipt
//! history. A method returning `Ok` means the write is persisted.
//!
//! The store is injected into the queue manager, gate and orchestrator as an
//! `Arc<dyn OfflineStore>` so tests can substitute [`MemoryStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::QueuedAction;
use crate::error::StoreError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// `"true"` while the last sync attempt failed at the transport level.
pub const FLAG_SYNC_BLOCKED: &str = "syncBlocked";
/// RFC 3339 timestamp of the last successful sync attempt.
pub const FLAG_LAST_SYNC_AT: &str = "lastSyncAt";
/// bcrypt hash of the offline recovery PIN.
pub const FLAG_PIN_HASH: &str = "offlinePinHash";
pub const FLAG_PIN_FAILED_ATTEMPTS: &str = "offlinePinFailedAttempts";
pub const FLAG_PIN_LAST_FAILURE_AT: &str = "offlinePinLastFailureAt";

/// Cache slot holding the reference-data snapshot.
pub const SNAPSHOT_SLOT: &str = "snapshot";

/// Links a provisional receipt number to the one the server issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptHistoryEntry {
    pub local_receipt_number: String,
    pub receipt_number: String,
    pub synced_at: DateTime<Utc>,
}

/// Persistence contract used by every other component.
pub trait OfflineStore: Send + Sync {
    /// Append a new action. Fails with `DuplicateAction` if the id exists.
    fn put_action(&self, action: &QueuedAction) -> Result<(), StoreError>;

    /// Persist `action.status` and its diagnostic fields. Payload and
    /// checksum are never rewritten. Returns `false` if the id is unknown.
    fn update_action(&self, action: &QueuedAction) -> Result<bool, StoreError>;

    /// Remove the given ids in one batch; returns how many existed.
    fn delete_actions(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Every queued action, in the order it was enqueued.
    fn list_actions(&self) -> Result<Vec<QueuedAction>, StoreError>;

    fn get_flag(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_flag(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_cache(&self, slot: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the whole slot with `value`.
    fn set_cache(&self, slot: &str, value: &Value) -> Result<(), StoreError>;

    /// Append to receipt history. Returns `false` (and keeps the existing
    /// entry) if the local receipt number is already recorded.
    fn append_receipt(&self, entry: &ReceiptHistoryEntry) -> Result<bool, StoreError>;

    /// Receipt history, oldest first.
    fn list_receipts(&self) -> Result<Vec<ReceiptHistoryEntry>, StoreError>;

    fn find_receipt(
        &self,
        local_receipt_number: &str,
    ) -> Result<Option<ReceiptHistoryEntry>, StoreError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;

    fn get_action(&self, id: &str) -> Result<Option<QueuedAction>, StoreError> {
        Ok(self.list_actions()?.into_iter().find(|a| a.id == id))
    }

    fn delete_action(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.delete_actions(&[id.to_string()])? > 0)
    }

    /// Actions not yet terminally resolved.
    fn count_unsettled(&self) -> Result<usize, StoreError> {
        Ok(self
            .list_actions()?
            .iter()
            .filter(|a| a.status.is_unsettled())
            .count())
    }

    fn is_sync_blocked(&self) -> Result<bool, StoreError> {
        Ok(self.get_flag(FLAG_SYNC_BLOCKED)?.as_deref() == Some("true"))
    }

    fn set_sync_blocked(&self, blocked: bool) -> Result<(), StoreError> {
        self.set_flag(FLAG_SYNC_BLOCKED, if blocked { "true" } else { "false" })
    }

    fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .get_flag(FLAG_LAST_SYNC_AT)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
