//! # Courier Core
//!
//! Shared building blocks for the Courier distributed message broker:
//!
//! - [`Message`] and its binary wire codec
//! - The length-prefixed frame protocol spoken between brokers, directories,
//!   and clients
//! - The [`Command`](command::Command) builder for directory-bound requests
//! - Topic and channel name validation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod error;
pub mod message;
pub mod names;
pub mod protocol;

pub use command::{Command, PeerAnnounce};
pub use error::{ClientError, CoreError, Result};
pub use message::{Message, MessageId, MSG_ID_LENGTH, MSG_MIN_SIZE};
