//! Typed errors that cross component boundaries.
//!
//! Application-level plumbing (the binary, store helpers) uses `eyre` with
//! `wrap_err` context; this enum is for the dispositions callers branch on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Circuit for the named dependency is open; the call failed fast.
    #[error("{dependency} is unavailable (circuit open)")]
    Unavailable { dependency: &'static str },

    /// A dependency call exceeded its per-operation deadline.
    #[error("{dependency} operation timed out")]
    Timeout { dependency: &'static str },

    /// A concurrent connect to the upstream stream is already in flight.
    #[error("already connecting to upstream")]
    AlreadyConnecting,

    /// The upstream socket is not open.
    #[error("not connected to upstream")]
    NotConnected,

    /// The wallet has no registration; the transaction was dropped.
    #[error("wallet {0} is not registered")]
    NotRegistered(String),

    /// Input failed validation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Version/algorithm/key-hash mismatch or auth-tag failure.
    /// No partial plaintext is ever returned.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wrapped application-layer failure (store helpers report via eyre).
    #[error("{0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<eyre::Report> for CoreError {
    fn from(report: eyre::Report) -> Self {
        CoreError::Internal(format!("{:#}", report))
    }
}

impl CoreError {
    /// Short machine-readable code, carried on system-error events.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unavailable { .. } => "unavailable",
            CoreError::Timeout { .. } => "timeout",
            CoreError::AlreadyConnecting => "already_connecting",
            CoreError::NotConnected => "not_connected",
            CoreError::NotRegistered(_) => "not_registered",
            CoreError::Validation(_) => "validation",
            CoreError::DecryptionFailed(_) => "decryption_failed",
            CoreError::EncryptionFailed(_) => "encryption_failed",
            CoreError::Store(_) => "store",
            CoreError::Cache(_) => "cache",
            CoreError::Stream(_) => "stream",
            CoreError::Serialization(_) => "serialization",
            CoreError::Internal(_) => "internal",
        }
    }
}
