//! Tunables for the offline queue and its sync loop.

use std::time::Duration;

/// Background sync loop interval.
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// Timeout for a sync batch submission (30 seconds).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight connectivity probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_RECEIPT_HISTORY_LIMIT: usize = 500;
const DEFAULT_MAX_PIN_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);

/// Runtime settings shared by the store, gate, orchestrator and monitor.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    /// Upper bound on a single sync submission; expiry counts as a
    /// transport failure and blocks sync.
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    /// Receipt history entries kept before the oldest are pruned.
    pub receipt_history_limit: usize,
    pub pin_hash_cost: u32,
    pub max_pin_attempts: u32,
    pub lockout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            receipt_history_limit: DEFAULT_RECEIPT_HISTORY_LIMIT,
            pin_hash_cost: bcrypt::DEFAULT_COST,
            max_pin_attempts: DEFAULT_MAX_PIN_ATTEMPTS,
            lockout: DEFAULT_LOCKOUT,
        }
    }
}

impl SyncSettings {
    /// Settings for tests: cheap bcrypt cost, short timeouts.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self {
            interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(50),
            pin_hash_cost: 4,
            ..Self::default()
        }
    }
}
