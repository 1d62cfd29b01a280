//! Error types for the connection pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Caller-visible errors from acquiring or using a pooled connection.
///
/// `Clone` so a single failed creation can be delivered to every caller
/// waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid connection configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to decrypt stored credentials: {0}")]
    DecryptionFailed(String),

    /// Carries the driver's message verbatim; it is shown to the user.
    #[error("{0}")]
    ConnectionFailed(String),

    #[error("connection {0} was invalidated while it was being opened")]
    Invalidated(i64),

    #[error("connection pool is shut down")]
    ShutDown,

    #[error("connection handle is closed")]
    HandleClosed,

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("{0}")]
    QueryFailed(String),
}

/// Error reported by a [`DatabaseDriver`](crate::driver::DatabaseDriver) or
/// one of its handles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

/// Credential decryption failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key unavailable: {0}")]
    Key(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

impl From<CipherError> for PoolError {
    fn from(err: CipherError) -> Self {
        PoolError::DecryptionFailed(err.to_string())
    }
}

/// Usage bookkeeping write failure. Logged by the tracker, never propagated.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage store write failed: {0}")]
    Write(String),

    #[error("connection {0} not found in usage store")]
    NotFound(i64),
}

impl From<sqlx::Error> for UsageError {
    fn from(err: sqlx::Error) -> Self {
        UsageError::Write(err.to_string())
    }
}
