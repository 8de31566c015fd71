//! Error types for the offline queue.
//!
//! Only structural and transport failures escape as errors. Per-action
//! outcomes reported by the server (rejected, conflict, failed) are carried
//! as queue state, never as `Err`.

use thiserror::Error;

/// Failures of the durable local store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot compression: {0}")]
    Compression(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Lock,

    #[error("action already queued: {0}")]
    DuplicateAction(String),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("migration v{version} failed: {detail}")]
    Migration { version: i32, detail: String },
}

/// Errors returned by the queue manager.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The recovery gate is armed and no PIN was verified this session.
    #[error("offline PIN verification required before queueing more actions")]
    PinRequired,

    /// The action was NOT queued; the operator must be told.
    #[error("offline action could not be queued: {0}")]
    Write(#[source] StoreError),

    #[error("malformed action: {0}")]
    Malformed(String),

    #[error("queued action not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by the PIN recovery gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{0}")]
    InvalidPin(String),

    #[error("too many failed attempts, try again in {remaining_minutes} minute(s)")]
    LockedOut { remaining_minutes: i64 },

    #[error("failed to hash PIN: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transport-level failures talking to the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("cannot reach server: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("http client: {0}")]
    Client(String),
}

/// Errors returned by a sync attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no valid session (user id, device id and auth token are required)")]
    MissingSession,

    #[error("a sync cycle is already in progress")]
    InProgress,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by the sale-completion branch point.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("malformed sale: {0}")]
    Malformed(String),

    #[error("no signed-in session for an online sale")]
    MissingSession,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
