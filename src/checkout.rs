//! Sale completion branch point.
//!
//! Online, the sale goes straight to the backend and never touches the queue.
//! Offline, it gets a provisional receipt number and is queued; the returned
//! [`QueuedReceipt`] is what the point-of-sale screen prints and shows until
//! sync reports the server receipt number.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::api::SaleClient;
use crate::envelope::{ActionStatus, ActionType, QueuedAction};
use crate::error::{CheckoutError, QueueError, StoreError};
use crate::queue::QueueManager;
use crate::sale::{OfflineAction, SaleCompletePayload, SaleCompleteResult, SaleDraft};
use crate::session::SessionSource;
use crate::store::OfflineStore;

/// Placeholder receipt for a sale waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedReceipt {
    pub action_id: String,
    pub local_audit_id: String,
    pub local_receipt_number: String,
    pub provisional_at: DateTime<Utc>,
    pub branch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub provisional_total: f64,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl QueuedReceipt {
    /// Placeholder for a queued sale; `None` for other action types or a
    /// payload that no longer decodes.
    pub fn from_action(action: &QueuedAction) -> Option<Self> {
        if action.action_type != ActionType::SaleComplete {
            return None;
        }
        let OfflineAction::SaleComplete(sale) =
            OfflineAction::from_parts(action.action_type, &action.payload).ok()?;
        Some(Self {
            action_id: action.id.clone(),
            local_audit_id: action.local_audit_id.clone(),
            provisional_total: sale.sale.provisional_total(),
            local_receipt_number: sale.local_receipt_number,
            provisional_at: action.provisional_at,
            branch_id: sale.sale.branch_id,
            customer_id: sale.sale.customer_id,
            status: action.status,
            conflict_reason: action.conflict_reason.clone(),
            error_message: action.error_message.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    /// Completed on the server.
    Completed(SaleCompleteResult),
    /// Queued for the next sync.
    Queued(QueuedReceipt),
}

pub struct Checkout<C> {
    queue: Arc<QueueManager>,
    client: Arc<C>,
    sessions: Arc<dyn SessionSource>,
}

impl<C: SaleClient> Checkout<C> {
    pub fn new(queue: Arc<QueueManager>, client: Arc<C>, sessions: Arc<dyn SessionSource>) -> Self {
        Self {
            queue,
            client,
            sessions,
        }
    }

    /// Complete `draft` online, or queue it when `online` is false.
    ///
    /// An online failure is returned as is; the sale is not queued behind
    /// the operator's back.
    pub async fn complete(
        &self,
        draft: SaleDraft,
        online: bool,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        draft.validate().map_err(CheckoutError::Malformed)?;
        let sale = SaleCompletePayload::new(draft, Utc::now());

        if online {
            let session = self
                .sessions
                .current()
                .filter(|s| s.is_valid())
                .ok_or(CheckoutError::MissingSession)?;
            let result = self.client.complete_sale(&session, &sale).await?;
            return Ok(CheckoutOutcome::Completed(result));
        }

        let local_receipt_number = sale.local_receipt_number.clone();
        let queued = self.queue.enqueue(&OfflineAction::SaleComplete(sale))?;
        let receipt = QueuedReceipt::from_action(&queued).ok_or_else(|| {
            CheckoutError::Queue(QueueError::Malformed(format!(
                "queued sale {} has an unreadable payload",
                queued.id
            )))
        })?;
        info!(
            local_receipt = %local_receipt_number,
            action_id = %queued.id,
            "sale queued offline"
        );
        Ok(CheckoutOutcome::Queued(receipt))
    }

    /// Placeholders for every sale still in the queue, oldest first.
    pub fn queued_receipts(&self) -> Result<Vec<QueuedReceipt>, QueueError> {
        Ok(self
            .queue
            .list()?
            .iter()
            .filter_map(QueuedReceipt::from_action)
            .collect())
    }
}

/// Server receipt number for a provisional one, once sync confirmed it.
pub fn resolve_receipt_number(
    store: &dyn OfflineStore,
    local_receipt_number: &str,
) -> Result<Option<String>, StoreError> {
    Ok(store
        .find_receipt(local_receipt_number)?
        .map(|entry| entry.receipt_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeTransport;
    use crate::config::SyncSettings;
    use crate::error::TransportError;
    use crate::gate::RecoveryGate;
    use crate::sale::sample_draft;
    use crate::session::Session;
    use crate::store::MemoryStore;
    use crate::sync::SyncOrchestrator;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<QueueManager>,
        transport: Arc<FakeTransport>,
        checkout: Checkout<FakeTransport>,
    }

    fn harness() -> Harness {
        let settings = SyncSettings::for_test();
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(RecoveryGate::new(store.clone(), &settings));
        let queue = Arc::new(QueueManager::new(store.clone(), gate));
        let transport = Arc::new(FakeTransport::new());
        let sessions: Arc<dyn SessionSource> =
            Arc::new(Session::new("user-1", "device-1", "token-1"));
        let checkout = Checkout::new(queue.clone(), transport.clone(), sessions);
        Harness {
            store,
            queue,
            transport,
            checkout,
        }
    }

    #[tokio::test]
    async fn test_online_sale_skips_queue() {
        let h = harness();
        let outcome = h.checkout.complete(sample_draft(), true).await.unwrap();
        assert!(matches!(
            outcome,
            CheckoutOutcome::Completed(ref r) if r.receipt_number.as_deref() == Some("R-000001")
        ));
        assert_eq!(h.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_failure_is_not_queued() {
        let h = harness();
        h.transport.set_online(false);
        let err = h.checkout.complete(sample_draft(), true).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Transport(TransportError::Connect(_))
        ));
        assert_eq!(h.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_sale_is_queued_with_placeholder() {
        let h = harness();
        let outcome = h.checkout.complete(sample_draft(), false).await.unwrap();
        let CheckoutOutcome::Queued(receipt) = outcome else {
            panic!("expected a queued sale");
        };
        assert!(receipt.local_receipt_number.starts_with("OFF-"));
        assert_eq!(receipt.status, ActionStatus::Pending);
        assert_eq!(receipt.provisional_total, 9.0);
        assert_eq!(h.transport.submission_count(), 0);
        assert_eq!(h.checkout.queued_receipts().unwrap(), vec![receipt]);
    }

    #[tokio::test]
    async fn test_malformed_sale_is_refused_before_branching() {
        let h = harness();
        let mut draft = sample_draft();
        draft.lines.clear();
        assert!(matches!(
            h.checkout.complete(draft, false).await,
            Err(CheckoutError::Malformed(_))
        ));
        assert_eq!(h.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_provisional_number_resolves_after_sync() {
        let h = harness();
        let CheckoutOutcome::Queued(receipt) =
            h.checkout.complete(sample_draft(), false).await.unwrap()
        else {
            panic!("expected a queued sale");
        };
        assert_eq!(
            resolve_receipt_number(h.store.as_ref(), &receipt.local_receipt_number).unwrap(),
            None
        );

        let sync = SyncOrchestrator::new(h.queue.clone(), h.transport.clone(), &SyncSettings::for_test());
        sync.sync(Some(&Session::new("user-1", "device-1", "token-1")))
            .await
            .unwrap();

        assert_eq!(
            resolve_receipt_number(h.store.as_ref(), &receipt.local_receipt_number)
                .unwrap()
                .as_deref(),
            Some("R-000001")
        );
        assert!(h.checkout.queued_receipts().unwrap().is_empty());
    }
}
