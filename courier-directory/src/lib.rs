//! # Courier Directory
//!
//! The discovery side of Courier. Brokers connect over TCP, identify
//! themselves, and register the topics and channels they host; consumers
//! and the admin tooling query the HTTP surface to find which brokers host
//! a topic. All state is in memory — directories are stateless across
//! restarts and rebuilt as brokers reconnect and resync.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registration;

pub use config::DirectoryConfig;
pub use directory::Directory;
pub use error::{DirectoryError, Result};
pub use registration::{PeerInfo, Producer, Registration, RegistrationDb};
