//! Sync orchestrator.
//!
//! One sync cycle reads the whole queue, submits it as a single batch keyed by
//! user and device, and reconciles the per-action outcomes:
//!
//! - `APPLIED`  -> removed; a sale with a server receipt number is recorded
//!   in receipt history
//! - `REJECTED` -> removed, never retried automatically
//! - `CONFLICT` / `FAILED` -> kept with diagnostics for the operator and
//!   resubmitted on the next cycle
//!
//! A transport failure (including the submission timeout) sets the
//! `syncBlocked` flag and leaves the queue untouched. Resubmitting a batch is
//! always safe because every action carries an immutable checksum and an
//! idempotency key the server deduplicates on.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::SyncTransport;
use crate::config::SyncSettings;
use crate::envelope::{ActionStatus, ActionType, QueuedAction};
use crate::error::{StoreError, SyncError, TransportError};
use crate::protocol::{RemoteStatus, SyncActionItem, SyncRequest, SyncResultItem};
use crate::queue::QueueManager;
use crate::sale::{self, ActionResult};
use crate::session::Session;
use crate::store::{OfflineStore, ReceiptHistoryEntry, FLAG_LAST_SYNC_AT, SNAPSHOT_SLOT};

const DEFAULT_CONFLICT_REASON: &str = "Conflict reported by server without a reason";
const DEFAULT_FAILURE_MESSAGE: &str = "Server failed to apply the action without a message";

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// How a server result was tied back to a local entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Exactly one unclaimed local entry has the result's checksum.
    Checksum(usize),
    /// Checksum was missing or ambiguous; exactly one unclaimed entry has
    /// the result's `localAuditId`.
    LocalAuditId(usize),
    Unmatched,
}

impl Correlation {
    pub fn index(&self) -> Option<usize> {
        match self {
            Correlation::Checksum(i) | Correlation::LocalAuditId(i) => Some(*i),
            Correlation::Unmatched => None,
        }
    }
}

/// Resolve one result against the submitted batch.
///
/// Order: unique checksum match, then unique `localAuditId` match, else
/// unmatched. Entries in `claimed` were already matched by an earlier result
/// and are never matched twice.
pub fn correlate(
    actions: &[QueuedAction],
    result: &SyncResultItem,
    claimed: &HashSet<usize>,
) -> Correlation {
    let unique = |pred: &dyn Fn(&QueuedAction) -> bool| {
        let mut hits = actions
            .iter()
            .enumerate()
            .filter(|(i, a)| !claimed.contains(i) && pred(*a))
            .map(|(i, _)| i);
        match (hits.next(), hits.next()) {
            (Some(i), None) => Some(i),
            _ => None,
        }
    };

    if let Some(i) = unique(&|a| a.checksum == result.checksum) {
        return Correlation::Checksum(i);
    }
    if let Some(audit) = result.local_audit_id.as_deref().filter(|s| !s.is_empty()) {
        if let Some(i) = unique(&|a| a.local_audit_id == audit) {
            return Correlation::LocalAuditId(i);
        }
    }
    Correlation::Unmatched
}

/// Correlate every result in response order.
pub fn correlate_all(actions: &[QueuedAction], results: &[SyncResultItem]) -> Vec<Correlation> {
    let mut claimed = HashSet::new();
    results
        .iter()
        .map(|result| {
            let c = correlate(actions, result, &claimed);
            if let Some(i) = c.index() {
                claimed.insert(i);
            }
            c
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub submitted: usize,
    pub applied: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub unmatched: usize,
    pub receipts_recorded: usize,
    pub cache_refreshed: bool,
    /// Unsettled entries left after the cycle.
    pub pending: usize,
}

/// Resets the in-flight flag however the cycle ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator<T> {
    store: Arc<dyn OfflineStore>,
    queue: Arc<QueueManager>,
    transport: Arc<T>,
    request_timeout: Duration,
    in_flight: AtomicBool,
}

impl<T: SyncTransport> SyncOrchestrator<T> {
    pub fn new(queue: Arc<QueueManager>, transport: Arc<T>, settings: &SyncSettings) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            transport,
            request_timeout: settings.request_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one reconciliation cycle.
    ///
    /// An empty queue succeeds without a session and clears a stale block.
    /// Otherwise `session` must be valid. Returns the transport error after
    /// blocking sync if the batch could not be delivered.
    pub async fn sync(&self, session: Option<&Session>) -> Result<SyncReport, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync requested while a cycle is in flight");
            return Err(SyncError::InProgress);
        }
        let _in_flight = InFlight(&self.in_flight);

        let actions = self.store.list_actions()?;
        if actions.is_empty() {
            self.mark_success()?;
            debug!("sync: queue empty, block cleared");
            return Ok(SyncReport::default());
        }

        let session = session
            .filter(|s| s.is_valid())
            .ok_or(SyncError::MissingSession)?;

        let request = SyncRequest {
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            actions: actions.iter().map(SyncActionItem::from).collect(),
        };
        info!(
            actions = request.actions.len(),
            device_id = %session.device_id,
            "submitting offline sync batch"
        );

        let submitted = tokio::time::timeout(
            self.request_timeout,
            self.transport.submit(session, &request),
        )
        .await;
        let response = match submitted {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.block(e)),
            Err(_) => return Err(self.block(TransportError::Timeout)),
        };

        let mut report = SyncReport {
            submitted: actions.len(),
            ..SyncReport::default()
        };
        let mut settled: Vec<String> = Vec::new();

        for (result, correlation) in response
            .results
            .iter()
            .zip(correlate_all(&actions, &response.results))
        {
            let Some(index) = correlation.index() else {
                warn!(
                    checksum = %result.checksum,
                    local_audit_id = result.local_audit_id.as_deref().unwrap_or(""),
                    status = ?result.status,
                    "sync result matches no queued action, skipping"
                );
                report.unmatched += 1;
                continue;
            };
            let action = &actions[index];
            debug!(id = %action.id, status = ?result.status, via = ?correlation, "reconciling action");

            match result.status {
                RemoteStatus::Applied => {
                    if self.record_receipt(action, result)? {
                        report.receipts_recorded += 1;
                    }
                    report.applied += 1;
                    settled.push(action.id.clone());
                }
                RemoteStatus::Rejected => {
                    warn!(
                        id = %action.id,
                        reason = result.error_message.as_deref().or(result.conflict_reason.as_deref()).unwrap_or(""),
                        "offline action rejected by server"
                    );
                    report.rejected += 1;
                    settled.push(action.id.clone());
                }
                RemoteStatus::Conflict | RemoteStatus::Failed => {
                    let mut updated = action.clone();
                    let (reason, message) = diagnostics_for(result);
                    updated.mark(ActionStatus::from(result.status), reason, message);
                    self.store.update_action(&updated)?;
                    if result.status == RemoteStatus::Conflict {
                        report.conflicts += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        self.store.delete_actions(&settled)?;

        if let Some(cache) = response.cache.as_ref() {
            self.store.set_cache(SNAPSHOT_SLOT, cache)?;
            report.cache_refreshed = true;
        }

        self.mark_success()?;

        // Compared against what subscribers last saw, which includes
        // enqueues made while the batch was in flight.
        report.pending = self.queue.publish_if_changed()?;

        info!(
            applied = report.applied,
            rejected = report.rejected,
            conflicts = report.conflicts,
            failed = report.failed,
            unmatched = report.unmatched,
            pending = report.pending,
            "offline sync cycle complete"
        );
        Ok(report)
    }

    /// Append receipt history for an applied sale. `Ok(false)` when there
    /// is nothing to record or the entry already exists.
    fn record_receipt(
        &self,
        action: &QueuedAction,
        result: &SyncResultItem,
    ) -> Result<bool, StoreError> {
        if action.action_type != ActionType::SaleComplete {
            return Ok(false);
        }
        let decoded = ActionResult::decode(action.action_type, result.result.as_ref());
        let (Some(local), Some(server)) = (
            sale::local_receipt_number(&action.payload),
            decoded.receipt_number(),
        ) else {
            return Ok(false);
        };
        let inserted = self.store.append_receipt(&ReceiptHistoryEntry {
            local_receipt_number: local.clone(),
            receipt_number: server.to_string(),
            synced_at: Utc::now(),
        })?;
        if inserted {
            info!(local_receipt = %local, receipt = server, "queued sale confirmed");
        }
        Ok(inserted)
    }

    fn mark_success(&self) -> Result<(), StoreError> {
        self.store.set_sync_blocked(false)?;
        self.store.set_flag(
            FLAG_LAST_SYNC_AT,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    fn block(&self, err: TransportError) -> SyncError {
        warn!(error = %err, "offline sync failed at transport level, blocking sync");
        if let Err(e) = self.store.set_sync_blocked(true) {
            error!(error = %e, "failed to persist syncBlocked flag");
        }
        SyncError::Transport(err)
    }
}

/// Diagnostics to persist for a `CONFLICT`/`FAILED` result. Never leaves a
/// conflict without a reason or a failure without a message.
fn diagnostics_for(result: &SyncResultItem) -> (Option<String>, Option<String>) {
    let text = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let reason = text(&result.conflict_reason);
    let message = text(&result.error_message);
    match result.status {
        RemoteStatus::Conflict => (
            Some(reason.unwrap_or_else(|| DEFAULT_CONFLICT_REASON.to_string())),
            message,
        ),
        _ => (
            reason,
            Some(message.unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeTransport;
    use crate::gate::RecoveryGate;
    use crate::protocol::SyncResponse;
    use crate::sale::sample_action;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<QueueManager>,
        transport: Arc<FakeTransport>,
        sync: SyncOrchestrator<FakeTransport>,
    }

    fn harness() -> Harness {
        let settings = SyncSettings::for_test();
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(RecoveryGate::new(store.clone(), &settings));
        let queue = Arc::new(QueueManager::new(store.clone(), gate));
        let transport = Arc::new(FakeTransport::new());
        let sync = SyncOrchestrator::new(queue.clone(), transport.clone(), &settings);
        Harness {
            store,
            queue,
            transport,
            sync,
        }
    }

    fn session() -> Session {
        Session::new("user-1", "device-1", "token-1")
    }

    fn result(checksum: &str, audit: Option<&str>, status: RemoteStatus) -> SyncResultItem {
        SyncResultItem {
            checksum: checksum.into(),
            local_audit_id: audit.map(str::to_string),
            status,
            conflict_reason: None,
            error_message: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn test_idempotent_resubmission_after_lost_response() {
        let h = harness();
        let queued = h.queue.enqueue(&sample_action()).unwrap();
        let local = sale::local_receipt_number(&queued.payload).unwrap();

        // Server applies the batch but the reply never arrives.
        h.transport.lose_next_responses(1);
        let err = h.sync.sync(Some(&session())).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(h.store.list_actions().unwrap(), vec![queued.clone()]);

        let report = h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!(report.applied, 1);

        let submissions = h.transport.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].actions, submissions[1].actions, "identical resubmission");
        assert_eq!(h.transport.sales_created(), 1, "no duplicate server-side sale");

        let history = h.store.list_receipts().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].local_receipt_number, local);
        assert_eq!(history[0].receipt_number, "R-000001");
        assert!(h.store.list_actions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_result_does_not_duplicate_receipt() {
        let h = harness();
        let queued = h.queue.enqueue(&sample_action()).unwrap();
        let checksum = queued.checksum.clone();
        h.transport.set_handler(move |_| {
            let applied = |receipt: &str| SyncResultItem {
                result: Some(json!({ "receiptNumber": receipt })),
                ..result(&checksum, None, RemoteStatus::Applied)
            };
            Ok(SyncResponse {
                results: vec![applied("R-1"), applied("R-OTHER")],
                cache: None,
            })
        });

        let report = h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.unmatched, 1);
        let history = h.store.list_receipts().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].receipt_number, "R-1");
    }

    #[tokio::test]
    async fn test_empty_queue_sync_clears_block() {
        let h = harness();
        h.store.set_sync_blocked(true).unwrap();
        assert_eq!(h.store.last_sync_at().unwrap(), None);

        let report = h.sync.sync(None).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert!(!h.store.is_sync_blocked().unwrap());
        assert!(h.store.last_sync_at().unwrap().is_some());
        assert_eq!(h.transport.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_batch_outcomes_are_isolated() {
        let h = harness();
        let a = h.queue.enqueue(&sample_action()).unwrap();
        let b = h.queue.enqueue(&sample_action()).unwrap();
        let c = h.queue.enqueue(&sample_action()).unwrap();

        let (ca, cb, cc) = (a.checksum.clone(), b.checksum.clone(), c.checksum.clone());
        h.transport.set_handler(move |_| {
            Ok(SyncResponse {
                results: vec![
                    SyncResultItem {
                        result: Some(json!({ "receiptNumber": "R-A" })),
                        ..result(&ca, None, RemoteStatus::Applied)
                    },
                    SyncResultItem {
                        conflict_reason: Some("stock changed on server".into()),
                        ..result(&cb, None, RemoteStatus::Conflict)
                    },
                    result(&cc, None, RemoteStatus::Rejected),
                ],
                cache: None,
            })
        });

        let report = h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!((report.applied, report.conflicts, report.rejected), (1, 1, 1));

        let remaining = h.store.list_actions().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
        assert_eq!(remaining[0].status, ActionStatus::Conflict);
        assert_eq!(
            remaining[0].conflict_reason.as_deref(),
            Some("stock changed on server")
        );
        assert_eq!(remaining[0].payload, b.payload);
        assert_eq!(remaining[0].checksum, b.checksum);

        let history = h.store.list_receipts().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            Some(history[0].local_receipt_number.clone()),
            sale::local_receipt_number(&a.payload)
        );
        assert_eq!(history[0].receipt_number, "R-A");
        assert!(!h.store.is_sync_blocked().unwrap());
    }

    #[tokio::test]
    async fn test_conflict_and_failure_always_carry_diagnostics() {
        let h = harness();
        let a = h.queue.enqueue(&sample_action()).unwrap();
        let b = h.queue.enqueue(&sample_action()).unwrap();
        let (ca, cb) = (a.checksum.clone(), b.checksum.clone());
        h.transport.set_handler(move |_| {
            Ok(SyncResponse {
                results: vec![
                    result(&ca, None, RemoteStatus::Conflict),
                    SyncResultItem {
                        error_message: Some("  ".into()),
                        ..result(&cb, None, RemoteStatus::Failed)
                    },
                ],
                cache: None,
            })
        });

        h.sync.sync(Some(&session())).await.unwrap();
        let a = h.store.get_action(&a.id).unwrap().unwrap();
        let b = h.store.get_action(&b.id).unwrap().unwrap();
        assert_eq!(a.conflict_reason.as_deref(), Some(DEFAULT_CONFLICT_REASON));
        assert_eq!(b.status, ActionStatus::Failed);
        assert_eq!(b.error_message.as_deref(), Some(DEFAULT_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_queue_intact() {
        let h = harness();
        h.queue.enqueue(&sample_action()).unwrap();
        h.queue.enqueue(&sample_action()).unwrap();
        let before = serde_json::to_vec(&h.store.list_actions().unwrap()).unwrap();

        h.transport.set_online(false);
        let err = h.sync.sync(Some(&session())).await.unwrap_err();
        assert!(
            matches!(err, SyncError::Transport(TransportError::Connect(_))),
            "got {err:?}"
        );

        let after = serde_json::to_vec(&h.store.list_actions().unwrap()).unwrap();
        assert_eq!(before, after);
        assert!(h.store.is_sync_blocked().unwrap());
        assert_eq!(h.store.last_sync_at().unwrap(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_arms_pin_gate() {
        let h = harness();
        h.queue.gate().provision_pin("8642").unwrap();
        h.queue.enqueue(&sample_action()).unwrap();

        h.transport.set_online(false);
        assert!(h.sync.sync(Some(&session())).await.is_err());

        let err = h.queue.enqueue(&sample_action()).unwrap_err();
        assert!(matches!(err, crate::error::QueueError::PinRequired));
        assert!(h.queue.status().unwrap().pin_required);

        h.transport.set_online(true);
        h.sync.sync(Some(&session())).await.unwrap();
        assert!(h.queue.enqueue(&sample_action()).is_ok(), "block cleared by sync");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transport_failure() {
        let h = harness();
        h.queue.enqueue(&sample_action()).unwrap();
        h.transport.set_delay(Duration::from_secs(5));

        let err = h.sync.sync(Some(&session())).await.unwrap_err();
        assert!(
            matches!(err, SyncError::Transport(TransportError::Timeout)),
            "got {err:?}"
        );
        assert!(h.store.is_sync_blocked().unwrap());
        assert_eq!(h.store.list_actions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_fails_fast() {
        let h = harness();
        h.queue.enqueue(&sample_action()).unwrap();

        let err = h.sync.sync(None).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingSession));
        let blank = Session::new("user-1", "device-1", "");
        assert!(matches!(
            h.sync.sync(Some(&blank)).await,
            Err(SyncError::MissingSession)
        ));

        assert_eq!(h.transport.submission_count(), 0);
        assert!(!h.store.is_sync_blocked().unwrap());
        assert_eq!(h.store.list_actions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_sync_is_refused() {
        let h = harness();
        h.queue.enqueue(&sample_action()).unwrap();
        h.transport.set_delay(Duration::from_millis(50));

        let s = session();
        let (first, second) = tokio::join!(h.sync.sync(Some(&s)), h.sync.sync(Some(&s)));
        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::InProgress)));
        assert_eq!(h.transport.submission_count(), 1);
        assert!(!h.sync.is_syncing());
    }

    #[tokio::test]
    async fn test_actions_enqueued_mid_sync_wait_for_next_cycle() {
        let h = harness();
        h.queue.enqueue(&sample_action()).unwrap();

        let queue = h.queue.clone();
        h.transport.set_handler(move |request| {
            queue.enqueue(&sample_action()).unwrap();
            Ok(SyncResponse {
                results: request
                    .actions
                    .iter()
                    .map(|a| result(&a.checksum, None, RemoteStatus::Applied))
                    .collect(),
                cache: None,
            })
        });

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.queue.subscribe(move |count| sink.lock().unwrap().push(count));

        let report = h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(h.store.list_actions().unwrap()[0].status, ActionStatus::Pending);

        // The mid-sync enqueue announced 2; the applied entry brings it back
        // to 1 and subscribers must end on the real count.
        assert_eq!(*seen.lock().unwrap(), vec![2, 1]);
        assert_eq!(
            seen.lock().unwrap().last().copied(),
            Some(h.queue.pending_count().unwrap())
        );
    }

    #[tokio::test]
    async fn test_subscriber_notification() {
        let h = harness();
        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = h.queue.clone();
        let _sub = h.queue.subscribe(move |count| {
            let actual = queue.pending_count().unwrap();
            sink.lock().unwrap().push((count, actual));
        });

        h.queue.enqueue(&sample_action()).unwrap();
        h.queue.enqueue(&sample_action()).unwrap();
        h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1), (2, 2), (0, 0)]);

        // A cycle that only turns PENDING into CONFLICT leaves the count alone.
        h.queue.enqueue(&sample_action()).unwrap();
        h.transport.set_handler(|request| {
            Ok(SyncResponse {
                results: request
                    .actions
                    .iter()
                    .map(|a| result(&a.checksum, None, RemoteStatus::Conflict))
                    .collect(),
                cache: None,
            })
        });
        h.sync.sync(Some(&session())).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1), (2, 2), (0, 0), (1, 1)]);
    }

    #[tokio::test]
    async fn test_response_cache_replaces_snapshot() {
        let h = harness();
        h.store
            .set_cache(SNAPSHOT_SLOT, &json!({ "branches": [{ "id": "old" }] }))
            .unwrap();
        h.queue.enqueue(&sample_action()).unwrap();
        h.transport.set_handler(|request| {
            Ok(SyncResponse {
                results: request
                    .actions
                    .iter()
                    .map(|a| result(&a.checksum, None, RemoteStatus::Applied))
                    .collect(),
                cache: Some(json!({ "variants": [{ "id": "var-1" }] })),
            })
        });

        let report = h.sync.sync(Some(&session())).await.unwrap();
        assert!(report.cache_refreshed);
        assert_eq!(report.receipts_recorded, 0, "no receipt number reported");
        assert_eq!(
            h.store.get_cache(SNAPSHOT_SLOT).unwrap(),
            Some(json!({ "variants": [{ "id": "var-1" }] }))
        );
    }

    #[test]
    fn test_correlation_prefers_checksum_then_audit_id() {
        let mut a = QueuedAction::build(ActionType::SaleComplete, json!({ "n": 1 })).unwrap();
        let mut b = QueuedAction::build(ActionType::SaleComplete, json!({ "n": 2 })).unwrap();
        a.local_audit_id = "audit-a".into();
        b.local_audit_id = "audit-b".into();
        let actions = vec![a.clone(), b.clone()];
        let none = HashSet::new();

        // Checksum wins even if the audit id points elsewhere.
        assert_eq!(
            correlate(&actions, &result(&b.checksum, Some("audit-a"), RemoteStatus::Applied), &none),
            Correlation::Checksum(1)
        );
        // Unknown checksum falls back to the audit id.
        assert_eq!(
            correlate(&actions, &result("zzz", Some("audit-a"), RemoteStatus::Applied), &none),
            Correlation::LocalAuditId(0)
        );
        // Neither matches.
        assert_eq!(
            correlate(&actions, &result("zzz", Some("nope"), RemoteStatus::Applied), &none),
            Correlation::Unmatched
        );
        assert_eq!(
            correlate(&actions, &result("zzz", None, RemoteStatus::Applied), &none),
            Correlation::Unmatched
        );
    }

    #[test]
    fn test_correlation_disambiguates_duplicate_checksums() {
        let a = QueuedAction::build(ActionType::SaleComplete, json!({ "same": true })).unwrap();
        let b = QueuedAction::build(ActionType::SaleComplete, json!({ "same": true })).unwrap();
        assert_eq!(a.checksum, b.checksum);
        let actions = vec![a.clone(), b.clone()];

        let ambiguous = result(&a.checksum, None, RemoteStatus::Applied);
        assert_eq!(
            correlate(&actions, &ambiguous, &HashSet::new()),
            Correlation::Unmatched
        );

        let by_audit = result(&a.checksum, Some(&b.local_audit_id), RemoteStatus::Applied);
        assert_eq!(
            correlate(&actions, &by_audit, &HashSet::new()),
            Correlation::LocalAuditId(1)
        );

        // Once b is claimed the checksum becomes unique again.
        let matched = correlate_all(&actions, &[by_audit, ambiguous]);
        assert_eq!(
            matched,
            vec![Correlation::LocalAuditId(1), Correlation::Checksum(0)]
        );
    }
}
