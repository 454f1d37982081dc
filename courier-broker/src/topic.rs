//! Topics: named streams fanned out to channels.
//!
//! Two cooperative tasks run per topic. The router drains the incoming
//! queue into the bounded in-memory queue, spilling to the backend when
//! memory is full; publishers therefore never block on a slow disk beyond a
//! single message. The message pump multiplexes memory, the backend stream,
//! and channel-set updates, handing one copy of each message to every
//! channel. With no channels attached the pump parks itself and is
//! restarted by the next channel creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use courier_core::{names, Message};
use courier_storage::{BackendQueue, DiskQueue};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::RegistrationEvent;
use crate::channel::Channel;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// A named stream on one broker.
pub struct Topic {
    name: String,
    opts: Arc<BrokerConfig>,

    channels: RwLock<HashMap<String, Arc<Channel>>>,
    channel_create_mu: AsyncMutex<()>,

    backend: Box<dyn BackendQueue>,
    incoming_tx: mpsc::Sender<Message>,
    incoming_rx: AsyncMutex<mpsc::Receiver<Message>>,
    memory_tx: mpsc::Sender<Message>,
    memory_rx: AsyncMutex<mpsc::Receiver<Message>>,
    update_tx: mpsc::Sender<()>,
    update_rx: AsyncMutex<mpsc::Receiver<()>>,

    exit_flag: AtomicBool,
    exit_tx: broadcast::Sender<()>,
    pump_running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,

    message_count: AtomicU64,
    notifier: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Topic {
    /// Create a topic and start its router. The pump starts lazily with the
    /// first channel.
    ///
    /// # Errors
    /// Fails if the name is invalid or the backend queue cannot be opened.
    pub async fn new(
        name: impl Into<String>,
        opts: Arc<BrokerConfig>,
        notifier: mpsc::UnboundedSender<RegistrationEvent>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if !names::is_valid_topic_name(&name) {
            return Err(BrokerError::InvalidName(name));
        }

        let backend = Box::new(
            DiskQueue::new(name.clone(), &opts.data_path, opts.max_bytes_per_file, opts.sync_every)
                .await?,
        );
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (memory_tx, memory_rx) = mpsc::channel(opts.mem_queue_size);
        let (update_tx, update_rx) = mpsc::channel(1);
        let (exit_tx, _) = broadcast::channel(1);

        let topic = Arc::new(Self {
            name,
            opts,
            channels: RwLock::new(HashMap::new()),
            channel_create_mu: AsyncMutex::new(()),
            backend,
            incoming_tx,
            incoming_rx: AsyncMutex::new(incoming_rx),
            memory_tx,
            memory_rx: AsyncMutex::new(memory_rx),
            update_tx,
            update_rx: AsyncMutex::new(update_rx),
            exit_flag: AtomicBool::new(false),
            exit_tx,
            pump_running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            message_count: AtomicU64::new(0),
            notifier,
        });

        let router = tokio::spawn(Arc::clone(&topic).router());
        topic.handles.lock().push(router);

        info!(topic = %topic.name, "new topic");
        let _ = topic.notifier.send(RegistrationEvent::TopicCreated(topic.name.clone()));
        Ok(topic)
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether shutdown has begun.
    pub fn exiting(&self) -> bool {
        self.exit_flag.load(Ordering::SeqCst)
    }

    /// Accept one message.
    ///
    /// # Errors
    /// Fails with [`BrokerError::Exiting`] once `close`/`delete` has begun.
    pub async fn put_message(&self, msg: Message) -> Result<()> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        self.incoming_tx.send(msg).await.map_err(|_| BrokerError::Exiting)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Accept a batch of messages.
    ///
    /// # Errors
    /// Fails with [`BrokerError::Exiting`] once `close`/`delete` has begun;
    /// messages before the failure point were accepted.
    pub async fn put_messages(&self, msgs: Vec<Message>) -> Result<()> {
        for msg in msgs {
            self.put_message(msg).await?;
        }
        Ok(())
    }

    /// Return the channel with the given name, creating it if needed and
    /// signalling the pump to include it.
    ///
    /// # Errors
    /// Fails on an invalid name, while exiting, or if the channel backend
    /// cannot be opened.
    pub async fn get_channel(self: &Arc<Self>, name: &str) -> Result<Arc<Channel>> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(Arc::clone(channel));
        }
        if !names::is_valid_channel_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }

        // Serialize creation so racing subscribers share one channel (and
        // one backend queue).
        let _guard = self.channel_create_mu.lock().await;
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(Arc::clone(channel));
        }
        let channel = Channel::new(
            self.name.clone(),
            name.to_string(),
            Arc::clone(&self.opts),
            self.notifier.clone(),
        )
        .await?;
        self.channels.write().insert(name.to_string(), Arc::clone(&channel));
        self.wake_pump();
        Ok(channel)
    }

    /// Return an existing channel.
    ///
    /// # Errors
    /// Fails with [`BrokerError::NotFound`] if it does not exist.
    pub fn get_existing_channel(&self, name: &str) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("{}/{name}", self.name)))
    }

    /// Remove a channel and delete it (discarding its messages).
    ///
    /// # Errors
    /// Fails with [`BrokerError::NotFound`] if it does not exist.
    pub async fn delete_existing_channel(&self, name: &str) -> Result<()> {
        let channel = self
            .channels
            .write()
            .remove(name)
            .ok_or_else(|| BrokerError::NotFound(format!("{}/{name}", self.name)))?;
        info!(topic = %self.name, channel = %name, "deleting channel");
        if let Err(err) = channel.delete().await {
            error!(topic = %self.name, channel = %name, %err, "channel delete failed");
        }
        let _ = self.update_tx.try_send(());
        Ok(())
    }

    /// Channels currently attached, in no particular order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Sum of in-memory and backend depth.
    pub fn depth(&self) -> i64 {
        let memory = (self.memory_tx.max_capacity() - self.memory_tx.capacity()) as i64;
        memory + self.backend.depth()
    }

    /// Backend depth alone.
    pub fn backend_depth(&self) -> i64 {
        self.backend.depth()
    }

    /// Total messages accepted.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Flush memory to the backend and stop, closing channels.
    ///
    /// # Errors
    /// Fails if already exiting or the final flush fails.
    pub async fn close(&self) -> Result<()> {
        self.exit(false).await
    }

    /// Discard everything, delete channels, and stop.
    ///
    /// # Errors
    /// Fails if already exiting or storage removal fails.
    pub async fn delete(&self) -> Result<()> {
        self.exit(true).await
    }

    async fn exit(&self, deleted: bool) -> Result<()> {
        if self.exit_flag.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Exiting);
        }
        info!(topic = %self.name, deleted, "closing topic");

        let _ = self.exit_tx.send(());
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        if deleted {
            let _ = self.notifier.send(RegistrationEvent::TopicDeleted(self.name.clone()));
            self.empty().await?;
            let channels: Vec<Arc<Channel>> =
                self.channels.write().drain().map(|(_, c)| c).collect();
            for channel in channels {
                if let Err(err) = channel.delete().await {
                    error!(topic = %self.name, channel = %channel.name(), %err, "channel delete failed");
                }
            }
        } else {
            for channel in self.channels() {
                if let Err(err) = channel.close().await {
                    error!(topic = %self.name, channel = %channel.name(), %err, "channel close failed");
                }
            }
            self.flush().await?;
        }
        self.backend.close().await?;
        Ok(())
    }

    async fn empty(&self) -> Result<()> {
        {
            let mut rx = self.memory_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        {
            let mut rx = self.incoming_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        self.backend.empty().await?;
        Ok(())
    }

    /// Write any messages left in memory to the backend.
    async fn flush(&self) -> Result<()> {
        let mut leftover = Vec::new();
        {
            let mut rx = self.incoming_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                leftover.push(msg);
            }
        }
        {
            let mut rx = self.memory_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                leftover.push(msg);
            }
        }
        if !leftover.is_empty() {
            info!(topic = %self.name, count = leftover.len(), "flushing messages to backend");
        }
        for msg in leftover {
            if let Err(err) = self.backend.put(msg.encode()).await {
                error!(topic = %self.name, %err, "failed to flush message to backend");
            }
        }
        Ok(())
    }

    /// Start the pump if it is parked, otherwise signal it to resnapshot
    /// the channel set.
    fn wake_pump(self: &Arc<Self>) {
        if self
            .pump_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let pump = tokio::spawn(Arc::clone(self).message_pump());
            self.handles.lock().push(pump);
        } else {
            let _ = self.update_tx.try_send(());
        }
    }

    /// Drains the incoming queue: non-blocking enqueue into memory, spill
    /// to the backend on overflow. This is the backpressure boundary.
    async fn router(self: Arc<Self>) {
        let mut incoming = self.incoming_rx.lock().await;
        let mut exit = self.exit_tx.subscribe();
        loop {
            tokio::select! {
                maybe = incoming.recv() => match maybe {
                    Some(msg) => self.route(msg).await,
                    None => break,
                },
                _ = exit.recv() => {
                    while let Ok(msg) = incoming.try_recv() {
                        self.route(msg).await;
                    }
                    break;
                }
            }
        }
        debug!(topic = %self.name, "router exiting");
    }

    async fn route(&self, msg: Message) {
        match self.memory_tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if let Err(err) = self.backend.put(msg.encode()).await {
                    // Documented data-loss point: dropping beats blocking
                    // every publisher on a failing disk.
                    error!(topic = %self.name, id = %msg.id, %err, "failed to write message to backend, dropping");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Fans each message out to every attached channel. Parks (and
    /// self-terminates) when the channel set drains to zero; the message
    /// that observed the empty set is returned to the incoming queue.
    async fn message_pump(self: Arc<Self>) {
        let mut memory = self.memory_rx.lock().await;
        let mut update = self.update_rx.lock().await;
        let mut exit = self.exit_tx.subscribe();
        let mut chans = self.channels();

        loop {
            // Biased so a pending channel-set update is always applied
            // before the next message is routed: a message published after
            // `get_channel` returns is guaranteed to see the new channel.
            let msg = tokio::select! {
                biased;
                _ = update.recv() => {
                    chans = self.channels();
                    continue;
                }
                _ = exit.recv() => break,
                Some(msg) = memory.recv() => msg,
                maybe = self.backend.read() => match maybe {
                    Some(buf) => match Message::decode(buf) {
                        Ok(msg) => msg,
                        Err(err) => {
                            error!(topic = %self.name, %err, "failed to decode message from backend");
                            continue;
                        }
                    },
                    None => break,
                },
            };

            if chans.is_empty() {
                // Park: put the message back and stop until the next
                // channel creation restarts the pump.
                self.pump_running.store(false, Ordering::SeqCst);
                if self.incoming_tx.send(msg).await.is_err() {
                    break;
                }
                if update.try_recv().is_ok()
                    && self
                        .pump_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    // A channel appeared while parking; keep pumping.
                    chans = self.channels();
                    continue;
                }
                break;
            }

            for channel in &chans {
                let copy = msg.fanout_copy();
                if let Err(err) = channel.put_message(copy).await {
                    error!(
                        topic = %self.name,
                        channel = %channel.name(),
                        id = %msg.id,
                        %err,
                        "failed to put message to channel"
                    );
                }
            }
        }
        debug!(topic = %self.name, "message pump exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_core::MessageId;
    use std::time::Duration;

    fn test_opts(data_path: std::path::PathBuf, mem_queue_size: usize) -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig { data_path, mem_queue_size, ..Default::default() })
    }

    async fn test_topic(mem_queue_size: usize) -> (Arc<Topic>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let topic =
            Topic::new("t", test_opts(dir.path().to_path_buf(), mem_queue_size), notify_tx)
                .await
                .unwrap();
        (topic, dir)
    }

    fn msg(body: &'static [u8]) -> Message {
        Message::new(MessageId::random(), Bytes::from_static(body))
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let res = Topic::new("bad name", test_opts(dir.path().to_path_buf(), 10), notify_tx).await;
        assert!(matches!(res, Err(BrokerError::InvalidName(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn fans_out_one_copy_per_channel() {
        let (topic, _dir) = test_topic(10).await;
        let a = topic.get_channel("a").await.unwrap();
        let b = topic.get_channel("b").await.unwrap();

        let id = MessageId::parse("0123456789abcdef0123456789abcdef").unwrap();
        topic.put_message(Message::new(id, Bytes::from_static(b"x"))).await.unwrap();

        for ch in [&a, &b] {
            let mut got = ch.next_message().await.unwrap();
            assert_eq!(got.id, id);
            assert_eq!(got.body, Bytes::from_static(b"x"));
            ch.start_in_flight(&mut got, 1, Duration::from_secs(60)).unwrap();
            assert_eq!(got.attempts, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spilled_messages_reach_channels_via_backend() {
        let (topic, _dir) = test_topic(1).await;
        let ch = topic.get_channel("only").await.unwrap();

        topic.put_message(msg(b"first")).await.unwrap();
        topic.put_message(msg(b"second")).await.unwrap();

        let mut bodies = vec![
            ch.next_message().await.unwrap().body,
            ch.next_message().await.unwrap().body,
        ];
        bodies.sort();
        assert_eq!(bodies, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_restarts_after_channel_set_drains() {
        let (topic, _dir) = test_topic(10).await;
        topic.get_channel("a").await.unwrap();
        topic.delete_existing_channel("a").await.unwrap();

        // Published while no channels exist; the pump parks and the
        // message waits.
        topic.put_message(msg(b"waiting")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let b = topic.get_channel("b").await.unwrap();
        let got = b.next_message().await.unwrap();
        assert_eq!(got.body, Bytes::from_static(b"waiting"));
    }

    #[tokio::test(start_paused = true)]
    async fn put_after_close_fails() {
        let (topic, _dir) = test_topic(10).await;
        topic.close().await.unwrap();
        assert!(matches!(topic.put_message(msg(b"late")).await, Err(BrokerError::Exiting)));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_notifies_unregistration() {
        let dir = tempfile::tempdir().unwrap();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let topic = Topic::new("t", test_opts(dir.path().to_path_buf(), 10), notify_tx)
            .await
            .unwrap();
        assert!(matches!(notify_rx.recv().await, Some(RegistrationEvent::TopicCreated(_))));

        topic.get_channel("c").await.unwrap();
        assert!(matches!(
            notify_rx.recv().await,
            Some(RegistrationEvent::ChannelCreated { .. })
        ));

        topic.delete().await.unwrap();
        assert!(matches!(notify_rx.recv().await, Some(RegistrationEvent::TopicDeleted(_))));
        assert!(matches!(
            notify_rx.recv().await,
            Some(RegistrationEvent::ChannelDeleted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn depth_sums_memory_and_backend() {
        let (topic, _dir) = test_topic(1).await;
        // No channels: router moves one message to memory, spills the rest.
        topic.put_message(msg(b"a")).await.unwrap();
        topic.put_message(msg(b"b")).await.unwrap();
        topic.put_message(msg(b"c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(topic.depth(), 3);
        assert_eq!(topic.backend_depth(), 2);
    }
}
