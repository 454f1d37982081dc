//! Broker configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Configuration for a broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address to bind for client connections.
    pub tcp_address: SocketAddr,

    /// Address to bind for the HTTP stats surface.
    pub http_address: SocketAddr,

    /// Address consumers should use to reach this broker, announced to
    /// directories.
    pub broadcast_address: String,

    /// Hostname announced to directories.
    pub hostname: String,

    /// TCP addresses of the directory servers to peer with.
    pub directory_tcp_addresses: Vec<String>,

    /// Directory for backend queue files.
    pub data_path: PathBuf,

    /// Messages held in memory per topic/channel before spilling to disk.
    pub mem_queue_size: usize,

    /// Maximum bytes per backend queue segment file.
    pub max_bytes_per_file: u64,

    /// Number of backend writes between fsyncs.
    pub sync_every: u64,

    /// Default in-flight timeout per delivery.
    pub msg_timeout: Duration,

    /// Largest acceptable message body.
    pub max_msg_size: u32,

    /// Largest acceptable command body (bounds `MPUB` batches).
    pub max_body_size: u32,

    /// Upper bound a client may set with `RDY`.
    pub max_ready_count: i64,

    /// Longest acceptable requeue delay.
    pub max_requeue_delay: Duration,

    /// Interval between server-initiated client heartbeats. The client
    /// read deadline is derived from this: see
    /// [`client_read_timeout`](Self::client_read_timeout).
    pub heartbeat_interval: Duration,

    /// Interval between heartbeat PINGs to each directory.
    pub directory_ping_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:4150".parse().expect("valid address"),
            http_address: "0.0.0.0:4151".parse().expect("valid address"),
            broadcast_address: "127.0.0.1".into(),
            hostname: default_hostname(),
            directory_tcp_addresses: Vec::new(),
            data_path: PathBuf::from("./data"),
            mem_queue_size: 10_000,
            max_bytes_per_file: 100 * 1024 * 1024,
            sync_every: 2500,
            msg_timeout: Duration::from_secs(60),
            max_msg_size: 1024 * 1024,
            max_body_size: 5 * 1024 * 1024,
            max_ready_count: 2500,
            max_requeue_delay: Duration::from_secs(60 * 60),
            heartbeat_interval: Duration::from_secs(30),
            directory_ping_interval: Duration::from_secs(15),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Fails if the file is unreadable or not valid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| BrokerError::Config(err.to_string()))
    }

    /// Validate field combinations.
    ///
    /// # Errors
    /// Returns [`BrokerError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.mem_queue_size == 0 {
            return Err(BrokerError::Config("mem_queue_size must be greater than 0".into()));
        }
        if self.max_bytes_per_file == 0 {
            return Err(BrokerError::Config("max_bytes_per_file must be greater than 0".into()));
        }
        if self.broadcast_address.is_empty() {
            return Err(BrokerError::Config("broadcast_address must not be empty".into()));
        }
        if self.max_ready_count <= 0 {
            return Err(BrokerError::Config("max_ready_count must be positive".into()));
        }
        if self.msg_timeout < Duration::from_millis(100) {
            return Err(BrokerError::Config("msg_timeout must be at least 100ms".into()));
        }
        if self.heartbeat_interval < Duration::from_secs(1) {
            return Err(BrokerError::Config("heartbeat_interval must be at least 1s".into()));
        }
        Ok(())
    }

    /// Idle time allowed on a client connection before it is closed: two
    /// consecutive unanswered heartbeats.
    pub fn client_read_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BrokerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_mem_queue_rejected() {
        let config = BrokerConfig { mem_queue_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_read_timeout_tracks_heartbeat_interval() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.client_read_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn sub_second_heartbeat_rejected() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
