//! Error types for ironpool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by pool, strategy and connection-manager operations.
///
/// Only exhaustion, creation failure and enlistment failure are expected to
/// reach an application caller. A listener failing validation is destroyed
/// and the acquire loop moves on; if nothing usable remains, the caller sees
/// the creation failure that ended the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no connection available in pool {pool} within {timeout:?}")]
    PoolExhausted { pool: String, timeout: Duration },

    #[error("connection creation failed (retryable: {retryable}): {reason}")]
    CreationFailed { retryable: bool, reason: String },

    #[error("transaction enlistment failed: {0}")]
    EnlistmentFailed(String),

    #[error("listener {listener} was already removed from the pool")]
    DoubleRemoval { listener: u64 },

    #[error("pool {0} has been shut down")]
    Shutdown(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    #[error("listener {listener} does not belong to pool {pool}")]
    ForeignListener { listener: u64, pool: String },

    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("credential resolution failed: {0}")]
    Security(String),
}

impl PoolError {
    /// Whether a caller may reasonably retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::PoolExhausted { .. } => true,
            PoolError::CreationFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Failure reported by a [`ConnectionFactory`](crate::factory::ConnectionFactory)
/// or a physical connection.
///
/// `retryable` separates transient backend unavailability from permanent
/// misconfiguration; it is carried through to [`PoolError::CreationFailed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FactoryError {
    pub retryable: bool,
    pub message: String,
}

impl FactoryError {
    /// A transient failure, e.g. the backend refused or timed out.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A permanent failure, e.g. bad credentials or a malformed address.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl From<FactoryError> for PoolError {
    fn from(err: FactoryError) -> Self {
        PoolError::CreationFailed {
            retryable: err.retryable,
            reason: err.message,
        }
    }
}

/// Rejection returned by a transaction coordinator when enlisting a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EnlistError(pub String);

impl EnlistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<EnlistError> for PoolError {
    fn from(err: EnlistError) -> Self {
        PoolError::EnlistmentFailed(err.0)
    }
}
