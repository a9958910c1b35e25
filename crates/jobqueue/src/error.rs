//! Queue error types.

use thiserror::Error;

/// Queue error type.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue closed")]
    Closed,
}

/// Queue result type.
pub type Result<T> = std::result::Result<T, QueueError>;
