//! Broker context: the topic set and everything the daemon shares.
//!
//! One `Broker` is constructed at startup and handed explicitly to every
//! component (listeners, the directory loop, the HTTP surface); there is no
//! process-wide singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use courier_core::{names, Command, PeerAnnounce};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::topic::Topic;

/// A topic/channel lifecycle event, consumed by the directory loop and
/// forwarded to every directory as `REGISTER`/`UNREGISTER`.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// A topic was created.
    TopicCreated(String),
    /// A topic was deleted (not merely closed at shutdown).
    TopicDeleted(String),
    /// A channel was created.
    ChannelCreated {
        /// Owning topic.
        topic: String,
        /// Channel name.
        channel: String,
    },
    /// A channel was deleted.
    ChannelDeleted {
        /// Owning topic.
        topic: String,
        /// Channel name.
        channel: String,
    },
}

/// The broker singleton-by-convention, passed around as an explicit handle.
pub struct Broker {
    config: Arc<BrokerConfig>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    topic_create_mu: AsyncMutex<()>,
    notify_tx: mpsc::UnboundedSender<RegistrationEvent>,
    exit_tx: broadcast::Sender<()>,
    exiting: AtomicBool,
    client_id_seq: AtomicU64,
    start: Instant,
}

impl Broker {
    /// Build a broker and the registration-event stream its directory loop
    /// consumes.
    pub fn new(config: BrokerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (exit_tx, _) = broadcast::channel(4);
        let broker = Arc::new(Self {
            config: Arc::new(config),
            topics: RwLock::new(HashMap::new()),
            topic_create_mu: AsyncMutex::new(()),
            notify_tx,
            exit_tx,
            exiting: AtomicBool::new(false),
            client_id_seq: AtomicU64::new(0),
            start: Instant::now(),
        });
        (broker, notify_rx)
    }

    /// Broker configuration.
    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    /// Whether shutdown has begun.
    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Subscribe to the shutdown broadcast.
    pub fn exit_subscribe(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Allocate a connection identifier.
    pub fn next_client_id(&self) -> u64 {
        self.client_id_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the topic with the given name, creating it if needed.
    ///
    /// # Errors
    /// Fails on an invalid name, while exiting, or if the topic backend
    /// cannot be opened.
    pub async fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }
        if !names::is_valid_topic_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }

        let _guard = self.topic_create_mu.lock().await;
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }
        let topic =
            Topic::new(name, Arc::clone(&self.config), self.notify_tx.clone()).await?;
        self.topics.write().insert(name.to_string(), Arc::clone(&topic));
        Ok(topic)
    }

    /// Return an existing topic.
    ///
    /// # Errors
    /// Fails with [`BrokerError::NotFound`] if it does not exist.
    pub fn get_existing_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))
    }

    /// Remove and delete a topic, discarding its messages.
    ///
    /// # Errors
    /// Fails with [`BrokerError::NotFound`] if it does not exist.
    pub async fn delete_existing_topic(&self, name: &str) -> Result<()> {
        let topic = self
            .topics
            .write()
            .remove(name)
            .ok_or_else(|| BrokerError::NotFound(name.to_string()))?;
        topic.delete().await
    }

    /// Snapshot of all topics.
    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// The identity announced to directories.
    pub fn peer_announce(&self) -> PeerAnnounce {
        PeerAnnounce {
            tcp_port: self.config.tcp_address.port(),
            http_port: self.config.http_address.port(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broadcast_address: self.config.broadcast_address.clone(),
            hostname: self.config.hostname.clone(),
        }
    }

    /// Build the `REGISTER` command set describing the current
    /// topic/channel set, for post-connect resync. Locks are released
    /// before the commands are sent.
    pub fn registration_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        for topic in self.topics.read().values() {
            let channels = topic.channels();
            if channels.is_empty() {
                commands.push(Command::register(topic.name(), None));
            } else {
                for channel in channels {
                    commands.push(Command::register(topic.name(), Some(channel.name())));
                }
            }
        }
        commands
    }

    /// Begin shutdown: stop accepting work, close every topic (flushing
    /// memory to disk), and stop background loops.
    pub async fn close(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("broker shutting down");
        let topics: Vec<Arc<Topic>> = self.topics.write().drain().map(|(_, t)| t).collect();
        for topic in topics {
            if let Err(err) = topic.close().await {
                error!(topic = %topic.name(), %err, "topic close failed");
            }
        }
        let _ = self.exit_tx.send(());
    }

    /// Point-in-time stats for the HTTP surface.
    pub fn stats(&self) -> BrokerStats {
        let mut topics: Vec<TopicStats> = self
            .topics()
            .iter()
            .map(|topic| {
                let mut channels: Vec<ChannelStats> = topic
                    .channels()
                    .iter()
                    .map(|ch| ChannelStats {
                        channel_name: ch.name().to_string(),
                        depth: ch.depth(),
                        backend_depth: ch.backend_depth(),
                        in_flight_count: ch.in_flight_count(),
                        deferred_count: ch.deferred_count(),
                        message_count: ch.message_count(),
                        requeue_count: ch.requeue_count(),
                        timeout_count: ch.timeout_count(),
                        client_count: ch.client_count(),
                        paused: ch.is_paused(),
                    })
                    .collect();
                channels.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
                TopicStats {
                    topic_name: topic.name().to_string(),
                    depth: topic.depth(),
                    backend_depth: topic.backend_depth(),
                    message_count: topic.message_count(),
                    channels,
                }
            })
            .collect();
        topics.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        BrokerStats {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.start.elapsed().as_secs(),
            topics,
        }
    }
}

/// Broker-wide stats.
#[derive(Debug, Serialize)]
pub struct BrokerStats {
    /// Broker software version.
    pub version: String,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Per-topic stats.
    pub topics: Vec<TopicStats>,
}

/// Per-topic stats.
#[derive(Debug, Serialize)]
pub struct TopicStats {
    /// Topic name.
    pub topic_name: String,
    /// Memory plus backend depth.
    pub depth: i64,
    /// Backend depth alone.
    pub backend_depth: i64,
    /// Total messages accepted.
    pub message_count: u64,
    /// Per-channel stats.
    pub channels: Vec<ChannelStats>,
}

/// Per-channel stats.
#[derive(Debug, Serialize)]
pub struct ChannelStats {
    /// Channel name.
    pub channel_name: String,
    /// Memory plus backend depth.
    pub depth: i64,
    /// Backend depth alone.
    pub backend_depth: i64,
    /// Messages delivered and unacknowledged.
    pub in_flight_count: usize,
    /// Messages parked for future delivery.
    pub deferred_count: usize,
    /// Total messages accepted.
    pub message_count: u64,
    /// Total client requeues.
    pub requeue_count: u64,
    /// Total in-flight timeouts.
    pub timeout_count: u64,
    /// Subscribed clients.
    pub client_count: usize,
    /// Whether delivery is paused.
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_broker() -> (Arc<Broker>, mpsc::UnboundedReceiver<RegistrationEvent>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let config =
            BrokerConfig { data_path: dir.path().to_path_buf(), ..Default::default() };
        let (broker, notify_rx) = Broker::new(config);
        (broker, notify_rx, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn get_topic_is_idempotent() {
        let (broker, _rx, _dir) = test_broker();
        let a = broker.get_topic("orders").await.unwrap();
        let b = broker.get_topic("orders").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_topic_name_rejected() {
        let (broker, _rx, _dir) = test_broker();
        assert!(matches!(
            broker.get_topic("not valid!").await,
            Err(BrokerError::InvalidName(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_commands_cover_topics_and_channels() {
        let (broker, _rx, _dir) = test_broker();
        broker.get_topic("t1").await.unwrap();
        let t2 = broker.get_topic("t2").await.unwrap();
        t2.get_channel("c1").await.unwrap();
        t2.get_channel("c2").await.unwrap();

        let mut lines: Vec<String> =
            broker.registration_commands().iter().map(|c| c.to_string()).collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["REGISTER t1", "REGISTER t2 c1", "REGISTER t2 c2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_new_topics() {
        let (broker, _rx, _dir) = test_broker();
        broker.get_topic("t").await.unwrap();
        broker.close().await;
        assert!(matches!(broker.get_topic("u").await, Err(BrokerError::Exiting)));
    }
}
