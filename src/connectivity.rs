//! Connectivity monitor.
//!
//! Decides when the sync orchestrator runs: on every offline -> online
//! transition, on each interval tick while online, and whenever the UI asks
//! via [`ConnectivityMonitor::trigger`]. Transitions are reported to the
//! backend fire-and-forget.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SyncTransport;
use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::protocol::{DeviceStatus, StatusReport};
use crate::session::SessionSource;
use crate::sync::{SyncOrchestrator, SyncReport};

#[derive(Debug, Clone, Copy)]
struct LinkState {
    online: bool,
    since: DateTime<Utc>,
}

pub struct ConnectivityMonitor<T> {
    orchestrator: Arc<SyncOrchestrator<T>>,
    sessions: Arc<dyn SessionSource>,
    interval: Duration,
    link: Mutex<Option<LinkState>>,
    wake: Notify,
    cancel: CancellationToken,
}

impl<T: SyncTransport + 'static> ConnectivityMonitor<T> {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator<T>>,
        sessions: Arc<dyn SessionSource>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            interval: settings.interval,
            link: Mutex::new(None),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Last known state; `false` until the first probe or event.
    pub fn is_online(&self) -> bool {
        self.link
            .lock()
            .ok()
            .and_then(|link| *link)
            .is_some_and(|link| link.online)
    }

    /// Start of the current online/offline period.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.link
            .lock()
            .ok()
            .and_then(|link| link.as_ref().map(|l| l.since))
    }

    /// Feed an external network event (OS or UI). Syncs when this is a
    /// transition to online.
    pub async fn set_online(&self, online: bool) -> Option<Result<SyncReport, SyncError>> {
        let came_online = self.record(online);
        if came_online {
            Some(self.run_sync().await)
        } else {
            None
        }
    }

    /// Probe the backend, record the result and sync if reachable.
    pub async fn tick(&self) -> Option<Result<SyncReport, SyncError>> {
        let online = match self.orchestrator.transport().probe().await {
            Ok(latency) => {
                debug!(latency_ms = latency.as_millis() as u64, "backend reachable");
                true
            }
            Err(e) => {
                debug!(error = %e, "backend unreachable");
                false
            }
        };
        self.record(online);
        if online {
            Some(self.run_sync().await)
        } else {
            None
        }
    }

    /// Ask the background loop for an immediate cycle.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Spawn the background loop. Runs until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = monitor.interval.as_secs_f64(),
                "connectivity monitor started"
            );
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.interval) => {}
                    _ = monitor.wake.notified() => debug!("sync triggered"),
                }
                if monitor.cancel.is_cancelled() {
                    break;
                }
                monitor.tick().await;
            }
            info!("connectivity monitor stopped");
        })
    }

    /// Store the new state. Returns true on a transition to online.
    fn record(&self, online: bool) -> bool {
        let previous = {
            let Ok(mut link) = self.link.lock() else {
                return false;
            };
            let previous = link.as_ref().map(|l| l.online);
            if previous != Some(online) {
                *link = Some(LinkState {
                    online,
                    since: Utc::now(),
                });
            }
            previous
        };
        if previous == Some(online) {
            return false;
        }

        if online {
            if previous == Some(false) {
                info!("network restored; resuming queued sync");
            }
        } else {
            info!("network offline; new sales will be queued");
        }
        self.report(online);
        online
    }

    fn report(&self, online: bool) {
        let Some(session) = self.sessions.current() else {
            debug!("no session, connectivity report skipped");
            return;
        };
        let report = StatusReport {
            device_id: session.device_id.clone(),
            status: if online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            },
            since: self.since(),
        };
        let transport = Arc::clone(self.orchestrator.transport());
        tokio::spawn(async move {
            if let Err(e) = transport.report_status(&session, &report).await {
                debug!(error = %e, "connectivity report not delivered");
            }
        });
    }

    async fn run_sync(&self) -> Result<SyncReport, SyncError> {
        let session = self.sessions.current();
        let outcome = self.orchestrator.sync(session.as_ref()).await;
        match &outcome {
            Ok(report) if report.submitted > 0 => {
                info!(applied = report.applied, pending = report.pending, "background sync done")
            }
            Ok(_) => {}
            Err(SyncError::InProgress) => debug!("sync already running"),
            Err(SyncError::MissingSession) => debug!("sync waiting for a signed-in session"),
            Err(e) => warn!(error = %e, "background sync failed"),
        }
        outcome
    }
}
