//! Storage error types.

use thiserror::Error;

/// Errors raised by backend queue implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An underlying file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue has been closed; no further operations are accepted.
    #[error("queue is closed")]
    Closed,

    /// The payload is not storable (empty or oversized).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
