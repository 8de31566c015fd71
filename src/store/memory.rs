//! In-memory [`OfflineStore`].
//!
//! Fast but non-persistent: everything is lost when the value is dropped.
//! Used for tests and for kiosks that deliberately run without a disk queue.
//! Writes can be made to fail on demand to exercise the loud-failure paths.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{OfflineStore, ReceiptHistoryEntry};
use crate::envelope::QueuedAction;
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    queue: Vec<QueuedAction>,
    flags: HashMap<String, String>,
    cache: HashMap<String, Value>,
    receipts: Vec<ReceiptHistoryEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    receipt_history_limit: usize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(500)
    }

    pub fn with_history_limit(receipt_history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            receipt_history_limit: receipt_history_limit.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Lock)
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        self.lock()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineStore for MemoryStore {
    fn put_action(&self, action: &QueuedAction) -> Result<(), StoreError> {
        let mut inner = self.lock_for_write()?;
        if inner.queue.iter().any(|a| a.id == action.id) {
            return Err(StoreError::DuplicateAction(action.id.clone()));
        }
        inner.queue.push(action.clone());
        Ok(())
    }

    fn update_action(&self, action: &QueuedAction) -> Result<bool, StoreError> {
        let mut inner = self.lock_for_write()?;
        match inner.queue.iter_mut().find(|a| a.id == action.id) {
            Some(existing) => {
                existing.mark(
                    action.status,
                    action.conflict_reason.clone(),
                    action.error_message.clone(),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_actions(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.lock_for_write()?;
        let before = inner.queue.len();
        inner.queue.retain(|a| !ids.contains(&a.id));
        Ok(before - inner.queue.len())
    }

    fn list_actions(&self) -> Result<Vec<QueuedAction>, StoreError> {
        Ok(self.lock()?.queue.clone())
    }

    fn get_flag(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.flags.get(key).cloned())
    }

    fn set_flag(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock_for_write()?
            .flags
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_cache(&self, slot: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.lock()?.cache.get(slot).cloned())
    }

    fn set_cache(&self, slot: &str, value: &Value) -> Result<(), StoreError> {
        self.lock_for_write()?
            .cache
            .insert(slot.to_string(), value.clone());
        Ok(())
    }

    fn append_receipt(&self, entry: &ReceiptHistoryEntry) -> Result<bool, StoreError> {
        let mut inner = self.lock_for_write()?;
        if inner
            .receipts
            .iter()
            .any(|r| r.local_receipt_number == entry.local_receipt_number)
        {
            return Ok(false);
        }
        inner.receipts.push(entry.clone());
        let overflow = inner.receipts.len().saturating_sub(self.receipt_history_limit);
        if overflow > 0 {
            inner.receipts.drain(..overflow);
        }
        Ok(true)
    }

    fn list_receipts(&self) -> Result<Vec<ReceiptHistoryEntry>, StoreError> {
        Ok(self.lock()?.receipts.clone())
    }

    fn find_receipt(
        &self,
        local_receipt_number: &str,
    ) -> Result<Option<ReceiptHistoryEntry>, StoreError> {
        Ok(self
            .lock()?
            .receipts
            .iter()
            .find(|r| r.local_receipt_number == local_receipt_number)
            .cloned())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
