//! Directory configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, Result};

/// Configuration for a directory instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Address to bind for broker connections.
    pub tcp_address: SocketAddr,

    /// Address to bind for the HTTP query surface.
    pub http_address: SocketAddr,

    /// Address reported in `IDENTIFY` responses.
    pub broadcast_address: String,

    /// Hostname reported in `IDENTIFY` responses.
    pub hostname: String,

    /// Producers unseen for longer than this are filtered from query
    /// results (but not removed).
    pub inactive_producer_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:4160".parse().expect("valid address"),
            http_address: "0.0.0.0:4161".parse().expect("valid address"),
            broadcast_address: "127.0.0.1".into(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            inactive_producer_timeout: Duration::from_secs(60),
        }
    }
}

impl DirectoryConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Fails if the file is unreadable or not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| DirectoryError::Config(err.to_string()))
    }

    /// Validate field combinations.
    ///
    /// # Errors
    /// Returns [`DirectoryError::Config`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_address.is_empty() {
            return Err(DirectoryError::Config("broadcast_address must not be empty".into()));
        }
        if self.inactive_producer_timeout.is_zero() {
            return Err(DirectoryError::Config(
                "inactive_producer_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
