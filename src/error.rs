//! Error taxonomy for the sync fabric.
//!
//! Transient I/O and per-file failures are handled (logged, skipped) at the
//! call site and never reach this type. Everything surfaced here is either
//! actionable by the caller (lock contention, timeouts) or terminal for the
//! operation (protocol violations, auth rejection, journal corruption).

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal / registry database failure. Callers treat this as fatal for
    /// the owning subsystem: the process exits non-zero so a supervisor can
    /// restart it.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Malformed frame, unknown message variant, or an encrypted envelope
    /// arriving where no key is configured.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Advisory lock contention. Names the current holder so callers can
    /// retry with backoff or report upward.
    #[error("path {path:?} is locked by {holder}")]
    LockHeld { path: String, holder: String },

    #[error("cursor for {consumer} may not move backwards ({from} -> {to})")]
    CursorRegression {
        consumer: String,
        from: i64,
        to: i64,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("vault root {0:?} does not exist or is not a directory")]
    VaultMissing(PathBuf),

    #[error("background task failed: {0}")]
    Blocking(String),
}

/// Run a blocking (SQLite / filesystem) closure on the blocking pool.
/// Network reader paths never execute these inline; a panic inside the
/// closure surfaces as an error instead of tearing down the caller.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(SyncError::Blocking(e.to_string())),
    }
}

impl SyncError {
    /// Shorthand for protocol violations built from format strings.
    pub fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        SyncError::Crypto(msg.into())
    }
}
