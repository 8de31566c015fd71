//! Offline queue manager.
//!
//! Operator-facing API for the offline action lifecycle: enqueue behind the
//! recovery gate, live pending-count subscriptions, and the sync status
//! summary shown on the point-of-sale screen.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::envelope::{ActionStatus, QueuedAction};
use crate::error::{GateError, QueueError, StoreError};
use crate::gate::{GateState, RecoveryGate};
use crate::sale::OfflineAction;
use crate::store::OfflineStore;

type Listener = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    /// Issued with each pending-count read, in read order.
    next_stamp: AtomicU64,
    /// Newest count handed to subscribers.
    published: Mutex<Published>,
}

#[derive(Default)]
struct Published {
    stamp: u64,
    count: Option<usize>,
}

impl Registry {
    fn remove(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&id);
        }
    }
}

/// Handle returned by [`QueueManager::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Queue summary for the status indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Entries not yet terminally resolved (pending + conflicts + failed).
    pub pending: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub sync_blocked: bool,
    pub pin_required: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

pub struct QueueManager {
    store: Arc<dyn OfflineStore>,
    gate: Arc<RecoveryGate>,
    registry: Arc<Registry>,
    // Serializes queue writes with the count read that follows them.
    // Never held while subscribers run.
    write_lock: Mutex<()>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn OfflineStore>, gate: Arc<RecoveryGate>) -> Self {
        Self {
            store,
            gate,
            registry: Arc::new(Registry::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn OfflineStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<RecoveryGate> {
        &self.gate
    }

    /// Build an envelope for `action`, persist it and notify subscribers.
    ///
    /// Fails with [`QueueError::PinRequired`] while the recovery gate is armed
    /// and with [`QueueError::Write`] if the store did not persist the entry.
    /// On any error nothing was queued; once the entry is persisted the call
    /// succeeds even if subscribers could not be told.
    pub fn enqueue(&self, action: &OfflineAction) -> Result<QueuedAction, QueueError> {
        let allowed = self.gate.allows_enqueue().map_err(|e| match e {
            GateError::Store(s) => QueueError::Write(s),
            other => QueueError::Write(StoreError::Unavailable(other.to_string())),
        })?;
        if !allowed {
            warn!("enqueue refused: offline PIN verification required");
            return Err(QueueError::PinRequired);
        }

        let payload = action
            .to_payload()
            .map_err(|e| QueueError::Malformed(e.to_string()))?;
        let envelope = QueuedAction::build(action.action_type(), payload)?;

        let stamped = {
            let _guard = self
                .write_lock
                .lock()
                .map_err(|_| QueueError::Write(StoreError::Lock))?;
            self.store.put_action(&envelope).map_err(|e| {
                error!(id = %envelope.id, error = %e, "failed to persist offline action");
                QueueError::Write(e)
            })?;
            self.stamped_count()
        };

        info!(
            id = %envelope.id,
            action_type = %envelope.action_type,
            checksum = %envelope.checksum,
            "offline action queued"
        );
        match stamped {
            Ok((stamp, count)) => self.deliver(stamp, count, false),
            Err(e) => warn!(
                id = %envelope.id,
                error = %e,
                "action queued but pending count unreadable, subscribers not notified"
            ),
        }
        Ok(envelope)
    }

    /// Register `callback` to receive the pending count after every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.registry.listeners.lock() {
            listeners.insert(id, Arc::new(callback));
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Entries with status `PENDING`, `CONFLICT` or `FAILED`.
    pub fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.count_unsettled()?)
    }

    /// All queued entries in enqueue order.
    pub fn list(&self) -> Result<Vec<QueuedAction>, QueueError> {
        Ok(self.store.list_actions()?)
    }

    /// Remove a `CONFLICT`/`FAILED` entry the operator resolved by hand.
    pub fn dismiss(&self, id: &str) -> Result<QueuedAction, QueueError> {
        let (action, stamped) = {
            let _guard = self
                .write_lock
                .lock()
                .map_err(|_| QueueError::Write(StoreError::Lock))?;
            let action = self
                .store
                .get_action(id)?
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if action.status == ActionStatus::Pending {
                return Err(QueueError::Malformed(format!(
                    "{id} is still pending and will be resubmitted on the next sync"
                )));
            }
            self.store.delete_action(id).map_err(QueueError::Write)?;
            (action, self.stamped_count())
        };
        info!(id, status = %action.status, "queued action dismissed by operator");
        match stamped {
            Ok((stamp, count)) => self.deliver(stamp, count, false),
            Err(e) => warn!(id, error = %e, "dismissed, but pending count unreadable"),
        }
        Ok(action)
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let actions = self.store.list_actions()?;
        let count = |s: ActionStatus| actions.iter().filter(|a| a.status == s).count();
        let pin_required = matches!(self.gate.state(), Ok(GateState::Required));
        Ok(QueueStatus {
            pending: actions.iter().filter(|a| a.status.is_unsettled()).count(),
            conflicts: count(ActionStatus::Conflict),
            failed: count(ActionStatus::Failed),
            sync_blocked: self.store.is_sync_blocked()?,
            pin_required,
            last_sync_at: self.store.last_sync_at()?,
        })
    }

    /// Re-read the pending count after a sync cycle and notify subscribers
    /// if it differs from the last count they were given.
    pub(crate) fn publish_if_changed(&self) -> Result<usize, StoreError> {
        let (stamp, count) = {
            let _guard = self.write_lock.lock().map_err(|_| StoreError::Lock)?;
            self.stamped_count()?
        };
        self.deliver(stamp, count, true);
        Ok(count)
    }

    /// Caller holds `write_lock`, so stamps follow the order of the reads.
    fn stamped_count(&self) -> Result<(u64, usize), StoreError> {
        let count = self.store.count_unsettled()?;
        let stamp = self.registry.next_stamp.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((stamp, count))
    }

    /// Hand `count` to subscribers unless a newer read was already delivered.
    fn deliver(&self, stamp: u64, count: usize, only_if_changed: bool) {
        {
            let Ok(mut published) = self.registry.published.lock() else {
                return;
            };
            if stamp < published.stamp {
                debug!(count, "superseded pending count dropped");
                return;
            }
            let unchanged = published.count == Some(count);
            published.stamp = stamp;
            published.count = Some(count);
            if only_if_changed && unchanged {
                return;
            }
        }
        self.notify(count);
    }

    fn notify(&self, count: usize) {
        // Clone out so a callback may subscribe or unsubscribe re-entrantly.
        let listeners: Vec<Listener> = match self.registry.listeners.lock() {
            Ok(l) => l.values().cloned().collect(),
            Err(_) => return,
        };
        debug!(count, subscribers = listeners.len(), "pending count changed");
        for listener in listeners {
            listener(count);
        }
    }
}
