//! Error types shared across the Courier crates.

use std::fmt;

use thiserror::Error;

/// Main error type for core protocol and codec operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A message failed to decode from its wire representation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A frame or response violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// An error attributable to a remote client of a protocol IOLoop.
///
/// Carries the wire error code sent back in the error frame and a fatality
/// flag: fatal errors close the connection after the frame is written,
/// non-fatal errors leave it open for the next command.
#[derive(Debug)]
pub struct ClientError {
    code: &'static str,
    message: String,
    fatal: bool,
}

impl ClientError {
    /// A protocol violation that forces the connection closed.
    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), fatal: true }
    }

    /// Bad arguments for a single command; the connection survives.
    pub fn non_fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), fatal: false }
    }

    /// Whether this error should terminate the connection.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// The wire error code, e.g. `E_INVALID`.
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for ClientError {}
