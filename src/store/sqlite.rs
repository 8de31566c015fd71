//! SQLite-backed [`OfflineStore`].

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{OfflineStore, ReceiptHistoryEntry};
use crate::db::DbState;
use crate::envelope::{ActionStatus, ActionType, QueuedAction};
use crate::error::StoreError;

/// zstd level for snapshot blobs; the cache is written rarely and read at
/// startup, so favour size.
const SNAPSHOT_COMPRESSION_LEVEL: i32 = 9;

const QUEUE_COLUMNS: &str = "id, action_type, payload, checksum, provisional_at, local_audit_id,
     status, conflict_reason, error_message";

/// Durable store on top of the shared [`DbState`] connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<DbState>,
    receipt_history_limit: usize,
}

impl SqliteStore {
    pub fn new(db: Arc<DbState>, receipt_history_limit: usize) -> Self {
        Self {
            db,
            receipt_history_limit: receipt_history_limit.max(1),
        }
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }
}

type QueueRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn read_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn corrupt(detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: "offline_queue",
        detail: detail.into(),
    }
}

fn decode_queue_row(row: QueueRow) -> Result<QueuedAction, StoreError> {
    let (
        id,
        action_type,
        payload,
        checksum,
        provisional_at,
        local_audit_id,
        status,
        conflict_reason,
        error_message,
    ) = row;

    let action_type: ActionType = action_type
        .parse()
        .map_err(|e: String| corrupt(format!("{id}: {e}")))?;
    let status: ActionStatus = status
        .parse()
        .map_err(|e: String| corrupt(format!("{id}: {e}")))?;
    let provisional_at = DateTime::parse_from_rfc3339(&provisional_at)
        .map_err(|e| corrupt(format!("{id}: provisional_at: {e}")))?
        .with_timezone(&Utc);
    let payload: Value = serde_json::from_str(&payload)?;

    Ok(QueuedAction {
        id,
        action_type,
        payload,
        checksum,
        provisional_at,
        local_audit_id,
        status,
        conflict_reason,
        error_message,
    })
}

fn prune_receipts(conn: &Connection, limit: usize) -> Result<usize, StoreError> {
    let removed = conn.execute(
        "DELETE FROM receipt_history WHERE id NOT IN (
             SELECT id FROM receipt_history ORDER BY id DESC LIMIT ?1
         )",
        params![limit as i64],
    )?;
    Ok(removed)
}

impl OfflineStore for SqliteStore {
    fn put_action(&self, action: &QueuedAction) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&action.payload)?;
        let conn = self.db.lock()?;
        let result = conn.execute(
            "INSERT INTO offline_queue (
                 id, action_type, payload, checksum, provisional_at, local_audit_id,
                 status, conflict_reason, error_message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                action.id,
                action.action_type.as_str(),
                payload,
                action.checksum,
                action
                    .provisional_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                action.local_audit_id,
                action.status.as_str(),
                action.conflict_reason,
                action.error_message,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && matches!(
                        e.extended_code,
                        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    ) =>
            {
                Err(StoreError::DuplicateAction(action.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_action(&self, action: &QueuedAction) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_queue
             SET status = ?1,
                 conflict_reason = ?2,
                 error_message = ?3,
                 updated_at = datetime('now')
             WHERE id = ?4",
            params![
                action.status.as_str(),
                action.conflict_reason,
                action.error_message,
                action.id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_actions(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM offline_queue WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        debug!(removed, requested = ids.len(), "deleted settled queue rows");
        Ok(removed)
    }

    fn list_actions(&self) -> Result<Vec<QueuedAction>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM offline_queue ORDER BY seq ASC"
        ))?;
        let rows: Vec<QueueRow> = stmt
            .query_map([], read_queue_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(decode_queue_row).collect()
    }

    fn get_action(&self, id: &str) -> Result<Option<QueuedAction>, StoreError> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM offline_queue WHERE id = ?1"),
                params![id],
                read_queue_row,
            )
            .optional()?;
        row.map(decode_queue_row).transpose()
    }

    fn count_unsettled(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM offline_queue
             WHERE status IN ('PENDING', 'CONFLICT', 'FAILED')",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn get_flag(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.db.lock()?;
        let value = conn
            .query_row(
                "SELECT flag_value FROM offline_flags WHERE flag_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_flag(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO offline_flags (flag_key, flag_value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(flag_key) DO UPDATE SET
                flag_value = excluded.flag_value,
                updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_cache(&self, slot: &str) -> Result<Option<Value>, StoreError> {
        let blob: Option<Vec<u8>> = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT data FROM snapshot_cache WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()?
        };
        match blob {
            Some(bytes) => {
                let raw = zstd::decode_all(bytes.as_slice())?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn set_cache(&self, slot: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)?;
        let compressed = zstd::encode_all(raw.as_slice(), SNAPSHOT_COMPRESSION_LEVEL)?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO snapshot_cache (slot, data, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(slot) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![slot, compressed],
        )?;
        debug!(
            slot,
            raw_bytes = raw.len(),
            stored_bytes = compressed.len(),
            "snapshot cache replaced"
        );
        Ok(())
    }

    fn append_receipt(&self, entry: &ReceiptHistoryEntry) -> Result<bool, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO receipt_history (local_receipt_number, receipt_number, synced_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.local_receipt_number,
                entry.receipt_number,
                entry.synced_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        if inserted > 0 {
            prune_receipts(&tx, self.receipt_history_limit)?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn list_receipts(&self) -> Result<Vec<ReceiptHistoryEntry>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT local_receipt_number, receipt_number, synced_at
             FROM receipt_history ORDER BY id ASC",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(decode_receipt_row).collect()
    }

    fn find_receipt(
        &self,
        local_receipt_number: &str,
    ) -> Result<Option<ReceiptHistoryEntry>, StoreError> {
        let conn = self.db.lock()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT local_receipt_number, receipt_number, synced_at
                 FROM receipt_history WHERE local_receipt_number = ?1",
                params![local_receipt_number],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(decode_receipt_row).transpose()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

fn decode_receipt_row(row: (String, String, String)) -> Result<ReceiptHistoryEntry, StoreError> {
    let (local_receipt_number, receipt_number, synced_at) = row;
    let synced_at = DateTime::parse_from_rfc3339(&synced_at)
        .map_err(|e| StoreError::Corrupt {
            table: "receipt_history",
            detail: format!("{local_receipt_number}: synced_at: {e}"),
        })?
        .with_timezone(&Utc);
    Ok(ReceiptHistoryEntry {
        local_receipt_number,
        receipt_number,
        synced_at,
    })
}
