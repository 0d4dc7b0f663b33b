//! Queue errors.

use thiserror::Error;

use crate::item::ItemId;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Item not found (explicit lookups only; reports on unknown ids are ignored).
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    /// Backing store failed. Transient, safe to retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Persisted state breaks a queue invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Caller supplied an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Queue configuration is unusable.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Item handler failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl QueueError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}
