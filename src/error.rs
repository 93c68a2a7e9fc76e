//! Crate-wide error taxonomy.
//!
//! Every public component operation returns [`CoreResult`]. Workers
//! (monitor sweep, messenger delivery loop) never propagate these; they log
//! and continue, per the propagation policy in spec.md.

use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input: unknown type, out-of-range priority, empty decision, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown id (message, scenario, execution, consensus, agent, source).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Status-transition violation: ack on non-delivered, modify terminated
    /// consensus, etc.
    #[error("conflict: {0}")]
    Conflict(String),

    /// HTTP or store timeout; retried locally by the caller.
    #[error("transient error: {0}")]
    Transient(String),

    /// Parse failure in monitor payload; the item is skipped, source stays
    /// healthy.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Consensus round exceeded its per-round timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store unavailable at startup; component refuses to initialize.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound { kind, id: id.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Transient(format!("store error: {err}"))
    }
}

impl From<tokio_rusqlite::Error> for CoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        CoreError::Transient(format!("store error: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!("invalid structured content: {err}"))
    }
}
