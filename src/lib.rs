//! Offline operation queue for a point-of-sale terminal.
//!
//! Sales completed while the backend is unreachable are stored durably as
//! checksummed actions, replayed in one idempotent batch when connectivity
//! returns, and reconciled against the per-action results the server sends
//! back. After a failed sync, new offline work is gated behind a
//! locally verified PIN.
//!
//! [`OfflineCore`] wires the store, recovery gate and queue together; the
//! sync orchestrator, connectivity monitor and checkout are built on top of
//! it with whichever transport the host provides.

pub mod api;
pub mod checkout;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod queue;
pub mod sale;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod sync;

use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use api::{HttpTransport, SaleClient, SyncTransport};
pub use checkout::{Checkout, CheckoutOutcome, QueuedReceipt};
pub use config::SyncSettings;
pub use connectivity::ConnectivityMonitor;
pub use envelope::{ActionStatus, ActionType, QueuedAction};
pub use error::{CheckoutError, GateError, QueueError, StoreError, SyncError, TransportError};
pub use gate::{GateState, RecoveryGate};
pub use queue::{QueueManager, QueueStatus, Subscription};
pub use sale::{OfflineAction, SaleCompletePayload, SaleDraft};
pub use session::{Session, SessionSource};
pub use snapshot::SnapshotCache;
pub use store::{MemoryStore, OfflineStore, SqliteStore};
pub use sync::{SyncOrchestrator, SyncReport};

/// Store, recovery gate and queue sharing one backing store.
pub struct OfflineCore {
    pub settings: SyncSettings,
    pub store: Arc<dyn OfflineStore>,
    pub gate: Arc<RecoveryGate>,
    pub queue: Arc<QueueManager>,
}

impl OfflineCore {
    /// Open (or create) the durable queue under `data_dir`.
    pub fn open(data_dir: &Path, settings: SyncSettings) -> Result<Self, StoreError> {
        let db = Arc::new(db::init(data_dir)?);
        let store: Arc<dyn OfflineStore> =
            Arc::new(SqliteStore::new(db, settings.receipt_history_limit));
        let core = Self::with_store(store, settings);
        info!(
            data_dir = %data_dir.display(),
            pending = core.queue.pending_count().unwrap_or_default(),
            "offline queue opened"
        );
        Ok(core)
    }

    /// Non-durable queue; everything is lost when the process exits.
    pub fn in_memory(settings: SyncSettings) -> Self {
        let store: Arc<dyn OfflineStore> = Arc::new(MemoryStore::with_history_limit(
            settings.receipt_history_limit,
        ));
        Self::with_store(store, settings)
    }

    pub fn with_store(store: Arc<dyn OfflineStore>, settings: SyncSettings) -> Self {
        let gate = Arc::new(RecoveryGate::new(store.clone(), &settings));
        let queue = Arc::new(QueueManager::new(store.clone(), gate.clone()));
        Self {
            settings,
            store,
            gate,
            queue,
        }
    }

    pub fn orchestrator<T: SyncTransport>(&self, transport: Arc<T>) -> SyncOrchestrator<T> {
        SyncOrchestrator::new(self.queue.clone(), transport, &self.settings)
    }

    pub fn connectivity<T: SyncTransport + 'static>(
        &self,
        orchestrator: Arc<SyncOrchestrator<T>>,
        sessions: Arc<dyn SessionSource>,
    ) -> ConnectivityMonitor<T> {
        ConnectivityMonitor::new(orchestrator, sessions, &self.settings)
    }

    pub fn checkout<C: SaleClient>(
        &self,
        client: Arc<C>,
        sessions: Arc<dyn SessionSource>,
    ) -> Checkout<C> {
        Checkout::new(self.queue.clone(), client, sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeTransport;
    use crate::sale::{sample_action, sample_draft};

    fn scratch_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pos-offline-core-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = scratch_dir();
        let id = {
            let core = OfflineCore::open(&dir, SyncSettings::for_test()).unwrap();
            core.queue.enqueue(&sample_action()).unwrap().id
        };

        let core = OfflineCore::open(&dir, SyncSettings::for_test()).unwrap();
        let pending = core.queue.list().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_offline_sale_then_sync_end_to_end() {
        let core = OfflineCore::in_memory(SyncSettings::for_test());
        let transport = Arc::new(FakeTransport::new());
        let sessions: Arc<dyn SessionSource> =
            Arc::new(Session::new("user-1", "device-1", "token-1"));
        let checkout = core.checkout(transport.clone(), sessions.clone());

        let outcome = checkout.complete(sample_draft(), false).await.unwrap();
        let CheckoutOutcome::Queued(receipt) = outcome else {
            panic!("expected a queued sale");
        };
        assert_eq!(core.queue.status().unwrap().pending, 1);

        let monitor = core.connectivity(Arc::new(core.orchestrator(transport)), sessions);
        let report = monitor.set_online(true).await.unwrap().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(core.queue.pending_count().unwrap(), 0);
        assert_eq!(
            checkout::resolve_receipt_number(core.store.as_ref(), &receipt.local_receipt_number)
                .unwrap()
                .as_deref(),
            Some("R-000001")
        );
    }
}
