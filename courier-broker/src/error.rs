//! Broker error types.

use courier_core::CoreError;
use courier_storage::StorageError;
use thiserror::Error;

/// Errors raised by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The entity has begun shutting down; no new work is accepted.
    #[error("exiting")]
    Exiting,

    /// A topic or channel name failed validation.
    #[error("invalid name '{0}'")]
    InvalidName(String),

    /// The referenced topic or channel does not exist.
    #[error("'{0}' not found")]
    NotFound(String),

    /// The referenced message is not tracked as in-flight.
    #[error("message not in flight")]
    NotInFlight,

    /// The message is already tracked as in-flight.
    #[error("message already in flight")]
    AlreadyInFlight,

    /// The message is in flight for a different client.
    #[error("client does not own message")]
    NotOwned,

    /// The directory peer link is not connected; pending transactions were
    /// failed and the next command will reconnect.
    #[error("directory peer disconnected")]
    Disconnected,

    /// A backend queue operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A protocol or codec operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
