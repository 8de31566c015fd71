//! Terminal credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager, on macOS Keychain, and on
//! Linux the Secret Service API (all via the `keyring` crate). Nothing here
//! is written to the queue database.

use keyring::Entry;
use tracing::{info, warn};

use crate::api;

const SERVICE_NAME: &str = "pos-offline-queue";

const KEY_ADMIN_URL: &str = "admin_url";
const KEY_DEVICE_ID: &str = "device_id";
const KEY_API_TOKEN: &str = "api_token";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_DEVICE_ID, KEY_API_TOKEN];

/// Everything needed to talk to the backend from this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalCredentials {
    pub admin_url: String,
    pub device_id: String,
    pub api_token: String,
}

/// Retrieve a single credential. `None` when missing or unreadable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

/// Delete a credential. Succeeds if it does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Stored credentials, or `None` until the terminal has been paired.
pub fn load_terminal_credentials() -> Option<TerminalCredentials> {
    let admin_url = get_credential(KEY_ADMIN_URL).filter(|s| !s.trim().is_empty())?;
    let device_id = get_credential(KEY_DEVICE_ID).filter(|s| !s.trim().is_empty())?;
    let api_token = get_credential(KEY_API_TOKEN).filter(|s| !s.trim().is_empty())?;
    Some(TerminalCredentials {
        admin_url,
        device_id,
        api_token,
    })
}

pub fn is_configured() -> bool {
    load_terminal_credentials().is_some()
}

/// Pair the terminal from a connection string issued by the admin dashboard.
pub fn store_connection_string(raw: &str) -> Result<TerminalCredentials, String> {
    let info = api::decode_connection_string(raw)
        .ok_or("Connection string is not valid or is missing url, tid or key")?;
    let credentials = TerminalCredentials {
        admin_url: info.admin_url,
        device_id: info.terminal_id,
        api_token: info.api_key,
    };

    set_credential(KEY_ADMIN_URL, &credentials.admin_url)?;
    set_credential(KEY_DEVICE_ID, &credentials.device_id)?;
    set_credential(KEY_API_TOKEN, &credentials.api_token)?;

    info!(device_id = %credentials.device_id, "terminal credentials updated");
    Ok(credentials)
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<(), String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
