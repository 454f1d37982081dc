//! Directory error types.

use courier_core::CoreError;
use thiserror::Error;

/// Errors raised by directory operations.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A protocol or codec operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;
