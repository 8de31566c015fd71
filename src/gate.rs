//! Offline recovery PIN gate.
//!
//! Once a PIN is provisioned and sync is blocked, further offline actions are
//! refused until the operator verifies the PIN. Verification lives only in
//! memory, so every new process starts locked again. Failed attempts are
//! counted in the store flags so a restart does not reset the lockout.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::SyncSettings;
use crate::error::GateError;
use crate::store::{
    OfflineStore, FLAG_PIN_FAILED_ATTEMPTS, FLAG_PIN_HASH, FLAG_PIN_LAST_FAILURE_AT,
};

const MIN_PIN_DIGITS: usize = 4;

/// Observable state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No PIN provisioned, or sync is not blocked.
    NotRequired,
    /// PIN provisioned and sync blocked; enqueue is refused.
    Required,
    /// Correct PIN supplied in this session.
    Verified,
}

struct Lockout {
    attempts: u32,
    last_failure: Option<DateTime<Utc>>,
}

pub struct RecoveryGate {
    store: Arc<dyn OfflineStore>,
    verified: AtomicBool,
    hash_cost: u32,
    max_attempts: u32,
    lockout: Duration,
}

impl RecoveryGate {
    pub fn new(store: Arc<dyn OfflineStore>, settings: &SyncSettings) -> Self {
        Self {
            store,
            verified: AtomicBool::new(false),
            hash_cost: settings.pin_hash_cost,
            max_attempts: settings.max_pin_attempts.max(1),
            lockout: Duration::from_std(settings.lockout).unwrap_or_else(|_| Duration::minutes(15)),
        }
    }

    /// Store the device recovery PIN. Digits only, at least four.
    pub fn provision_pin(&self, pin: &str) -> Result<(), GateError> {
        let pin = Zeroizing::new(pin.trim().to_string());
        if pin.len() < MIN_PIN_DIGITS {
            return Err(GateError::InvalidPin(format!(
                "PIN must be at least {MIN_PIN_DIGITS} digits"
            )));
        }
        if !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(GateError::InvalidPin("PIN must contain only digits".into()));
        }

        let hash =
            bcrypt::hash(pin.as_str(), self.hash_cost).map_err(|e| GateError::Hash(e.to_string()))?;
        self.store.set_flag(FLAG_PIN_HASH, &hash)?;
        self.persist_lockout(&Lockout {
            attempts: 0,
            last_failure: None,
        })?;
        info!("offline recovery PIN provisioned");
        Ok(())
    }

    pub fn is_provisioned(&self) -> Result<bool, GateError> {
        Ok(self.store.get_flag(FLAG_PIN_HASH)?.is_some())
    }

    /// True when a PIN is provisioned and a sync block is in effect.
    pub fn is_required(&self) -> Result<bool, GateError> {
        Ok(self.is_provisioned()? && self.store.is_sync_blocked()?)
    }

    pub fn state(&self) -> Result<GateState, GateError> {
        if !self.is_required()? {
            return Ok(GateState::NotRequired);
        }
        if self.verified.load(Ordering::SeqCst) {
            Ok(GateState::Verified)
        } else {
            Ok(GateState::Required)
        }
    }

    /// Whether the queue manager may accept a new action right now.
    pub fn allows_enqueue(&self) -> Result<bool, GateError> {
        Ok(self.state()? != GateState::Required)
    }

    /// Check `candidate` against the stored PIN.
    ///
    /// Returns `Ok(false)` for a wrong PIN (or when none is provisioned) and
    /// `Err(LockedOut)` while the attempt limit is in force.
    pub fn verify(&self, candidate: impl Into<String>) -> Result<bool, GateError> {
        let candidate = Zeroizing::new(candidate.into());

        let Some(hash) = self.store.get_flag(FLAG_PIN_HASH)? else {
            warn!("PIN verification attempted with no PIN provisioned");
            return Ok(false);
        };

        let mut lockout = self.load_lockout()?;
        self.check_lockout(&lockout)?;

        // bcrypt compares the full digest, independent of PIN length.
        if bcrypt::verify(candidate.as_str(), &hash).unwrap_or(false) {
            lockout.attempts = 0;
            lockout.last_failure = None;
            self.persist_lockout(&lockout)?;
            self.verified.store(true, Ordering::SeqCst);
            info!("offline recovery PIN verified");
            return Ok(true);
        }

        // A lockout that ran out starts a fresh window.
        if lockout.attempts >= self.max_attempts {
            lockout.attempts = 0;
        }
        lockout.attempts += 1;
        lockout.last_failure = Some(Utc::now());
        self.persist_lockout(&lockout)?;
        warn!(attempts = lockout.attempts, "failed offline PIN attempt");
        Ok(false)
    }

    /// Drop the in-memory verification, e.g. on operator sign-out.
    pub fn reset_session(&self) {
        self.verified.store(false, Ordering::SeqCst);
    }

    fn check_lockout(&self, lockout: &Lockout) -> Result<(), GateError> {
        if lockout.attempts < self.max_attempts {
            return Ok(());
        }
        let Some(last) = lockout.last_failure else {
            return Ok(());
        };
        let elapsed = Utc::now() - last;
        if elapsed < self.lockout {
            let remaining = (self.lockout - elapsed).num_minutes().max(1);
            return Err(GateError::LockedOut {
                remaining_minutes: remaining,
            });
        }
        Ok(())
    }

    fn load_lockout(&self) -> Result<Lockout, GateError> {
        let attempts = self
            .store
            .get_flag(FLAG_PIN_FAILED_ATTEMPTS)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let last_failure = self
            .store
            .get_flag(FLAG_PIN_LAST_FAILURE_AT)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Lockout {
            attempts,
            last_failure,
        })
    }

    fn persist_lockout(&self, lockout: &Lockout) -> Result<(), GateError> {
        self.store
            .set_flag(FLAG_PIN_FAILED_ATTEMPTS, &lockout.attempts.to_string())?;
        let last = lockout
            .last_failure
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        self.store.set_flag(FLAG_PIN_LAST_FAILURE_AT, &last)?;
        Ok(())
    }
}
