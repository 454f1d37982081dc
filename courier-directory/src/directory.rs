//! Directory context: the registration index and shared handles.

use std::sync::Arc;

use courier_core::PeerAnnounce;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::DirectoryConfig;
use crate::registration::RegistrationDb;

/// The directory singleton-by-convention, passed around as an explicit
/// handle.
pub struct Directory {
    /// The registration index.
    pub db: RegistrationDb,
    config: Arc<DirectoryConfig>,
    exit_tx: broadcast::Sender<()>,
}

impl Directory {
    /// Build a directory from its configuration.
    pub fn new(config: DirectoryConfig) -> Arc<Self> {
        let (exit_tx, _) = broadcast::channel(4);
        Arc::new(Self { db: RegistrationDb::new(), config: Arc::new(config), exit_tx })
    }

    /// Directory configuration.
    pub fn config(&self) -> &Arc<DirectoryConfig> {
        &self.config
    }

    /// Subscribe to the shutdown broadcast.
    pub fn exit_subscribe(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Begin shutdown: stop the listeners.
    pub fn close(&self) {
        info!("directory shutting down");
        let _ = self.exit_tx.send(());
    }

    /// The identity returned to identifying brokers.
    pub fn announce(&self) -> PeerAnnounce {
        PeerAnnounce {
            tcp_port: self.config.tcp_address.port(),
            http_port: self.config.http_address.port(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broadcast_address: self.config.broadcast_address.clone(),
            hostname: self.config.hostname.clone(),
        }
    }
}
