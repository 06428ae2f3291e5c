//! Error types for certificate storage.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the object store, the lock manager and the storage facade.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Invalid configuration (bad key length, missing bucket, bad endpoint).
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The cancellation signal fired before the lock could be obtained.
    #[error("lock not acquired for '{key}'")]
    LockNotAcquired { key: String },

    /// A non-lock operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Stored payload failed authentication (wrong key or tampered bytes).
    #[error("payload authentication failed")]
    Authentication,

    /// Sealing a payload failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The object store answered with a non-success status.
    #[error("object store returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// The request never completed (connection, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The object store answered with something we could not interpret.
    #[error("invalid response from object store: {0}")]
    InvalidResponse(String),
}

impl StorageError {
    /// Whether this is the "does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error came from talking to the object store.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Transport(_) | Self::InvalidResponse(_)
        )
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}
