//! Signed-in session used to authenticate sync batches.

use std::sync::Mutex;
use tracing::info;

use crate::storage::{self, TerminalCredentials};

/// Operator, device and credential a sync batch is submitted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
    pub auth_token: String,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            auth_token: auth_token.into(),
        }
    }

    /// All three parts present and non-blank.
    pub fn is_valid(&self) -> bool {
        !self.user_id.trim().is_empty()
            && !self.device_id.trim().is_empty()
            && !self.auth_token.trim().is_empty()
    }
}

/// Where the orchestrator and monitor get the current session from.
pub trait SessionSource: Send + Sync {
    fn current(&self) -> Option<Session>;
}

impl SessionSource for Session {
    fn current(&self) -> Option<Session> {
        Some(self.clone())
    }
}

/// Session assembled from keyring credentials and the signed-in operator.
#[derive(Default)]
pub struct KeyringSessionSource {
    user_id: Mutex<Option<String>>,
}

impl KeyringSessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: &str) {
        if let Ok(mut current) = self.user_id.lock() {
            *current = Some(user_id.trim().to_string());
            info!(user_id, "operator signed in");
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut current) = self.user_id.lock() {
            *current = None;
        }
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.lock().ok().and_then(|u| u.clone())
    }
}

impl SessionSource for KeyringSessionSource {
    fn current(&self) -> Option<Session> {
        let user_id = self.user_id()?;
        let TerminalCredentials {
            device_id,
            api_token,
            ..
        } = storage::load_terminal_credentials()?;
        Some(Session::new(user_id, device_id, api_token)).filter(Session::is_valid)
    }
}
