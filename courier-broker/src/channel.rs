//! Channels: consumer groups within a topic.
//!
//! A channel receives a copy of every topic message and load-balances
//! delivery among its subscribers. Delivered messages are tracked in-flight
//! until finished; unacknowledged messages are redelivered after a timeout,
//! and requeues with a delay park in a deferred queue until their ready
//! time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{names, Message, MessageId};
use courier_storage::{BackendQueue, DiskQueue, NullQueue};
use parking_lot::{Mutex, RwLock};
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::broker::RegistrationEvent;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// Floor on the background sweep interval; deadlines are honored no more
/// than this much late.
const SCAN_FLOOR: Duration = Duration::from_millis(100);

struct InFlight {
    msg: Message,
    client_id: u64,
    deadline: Instant,
}

struct Deferred {
    ready_at: Instant,
    seq: u64,
    msg: Message,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Equal ready-times break ties by insertion order.
        self.ready_at.cmp(&other.ready_at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TrackedState {
    in_flight: HashMap<MessageId, InFlight>,
    deferred: BinaryHeap<Reverse<Deferred>>,
    seq: u64,
}

/// A consumer group attached to one topic.
pub struct Channel {
    topic_name: String,
    name: String,
    ephemeral: bool,
    mem_queue_size: usize,

    backend: Box<dyn BackendQueue>,
    // The ready queue: permits on the semaphore track queued messages, so
    // any number of subscribers can wait for work without holding a lock,
    // and `empty` can drain at any time.
    ready: Mutex<VecDeque<Message>>,
    ready_sem: Semaphore,

    // In-flight table and deferred heap share a lock: transitions for a
    // given identifier are serialized here.
    state: Mutex<TrackedState>,
    in_flight_notify: Notify,
    deferred_notify: Notify,

    clients: RwLock<HashMap<u64, String>>,
    paused: AtomicBool,
    pause_notify: Notify,

    exit_flag: AtomicBool,
    exit_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    notifier: mpsc::UnboundedSender<RegistrationEvent>,

    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,
}

impl Channel {
    /// Create a channel and start its background monitors.
    ///
    /// Ephemeral channels (`#ephemeral` suffix) never create a disk
    /// backend; their memory overflow drops the oldest messages instead of
    /// spilling.
    pub(crate) async fn new(
        topic_name: String,
        name: String,
        opts: Arc<BrokerConfig>,
        notifier: mpsc::UnboundedSender<RegistrationEvent>,
    ) -> Result<Arc<Self>> {
        let ephemeral = names::is_ephemeral(&name);
        let backend: Box<dyn BackendQueue> = if ephemeral {
            Box::new(NullQueue::new())
        } else {
            Box::new(
                DiskQueue::new(
                    format!("{topic_name}:{name}"),
                    &opts.data_path,
                    opts.max_bytes_per_file,
                    opts.sync_every,
                )
                .await?,
            )
        };

        let (exit_tx, _) = broadcast::channel(1);
        let channel = Arc::new(Self {
            topic_name,
            name,
            ephemeral,
            mem_queue_size: opts.mem_queue_size,
            backend,
            ready: Mutex::new(VecDeque::new()),
            ready_sem: Semaphore::new(0),
            state: Mutex::new(TrackedState::default()),
            in_flight_notify: Notify::new(),
            deferred_notify: Notify::new(),
            clients: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            exit_flag: AtomicBool::new(false),
            exit_tx,
            handles: Mutex::new(Vec::new()),
            notifier,
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
        });

        let monitors = [
            tokio::spawn(Arc::clone(&channel).in_flight_monitor()),
            tokio::spawn(Arc::clone(&channel).deferred_monitor()),
        ];
        channel.handles.lock().extend(monitors);

        info!(topic = %channel.topic_name, channel = %channel.name, "new channel");
        let _ = channel.notifier.send(RegistrationEvent::ChannelCreated {
            topic: channel.topic_name.clone(),
            channel: channel.name.clone(),
        });
        Ok(channel)
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning topic name.
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Whether this channel vanishes when its last client disconnects.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Whether shutdown has begun.
    pub fn exiting(&self) -> bool {
        self.exit_flag.load(Ordering::SeqCst)
    }

    /// Enqueue one message for delivery.
    ///
    /// # Errors
    /// Fails with [`BrokerError::Exiting`] once `close`/`delete` has begun,
    /// or if the backend spill fails.
    pub async fn put_message(&self, msg: Message) -> Result<()> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        self.enqueue(msg).await?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Memory first; on overflow, durable channels spill to the backend and
    /// ephemeral channels evict their oldest message.
    async fn enqueue(&self, msg: Message) -> Result<()> {
        let overflow = {
            let mut queue = self.ready.lock();
            if queue.len() < self.mem_queue_size {
                queue.push_back(msg);
                None
            } else if self.ephemeral {
                if let Some(dropped) = queue.pop_front() {
                    debug!(
                        topic = %self.topic_name,
                        channel = %self.name,
                        id = %dropped.id,
                        "ephemeral overflow, dropping oldest message"
                    );
                    if let Ok(permit) = self.ready_sem.try_acquire() {
                        permit.forget();
                    }
                }
                queue.push_back(msg);
                None
            } else {
                Some(msg)
            }
        };
        match overflow {
            None => {
                self.ready_sem.add_permits(1);
                Ok(())
            }
            Some(msg) => {
                self.backend.put(msg.encode()).await?;
                Ok(())
            }
        }
    }

    /// Wait for the next ready message.
    ///
    /// Callers race on an internal lock, which is what load-balances a
    /// channel across its subscribers. Returns `None` once the channel is
    /// closed.
    pub async fn next_message(&self) -> Option<Message> {
        if self.exiting() {
            return None;
        }
        let mut exit = self.exit_tx.subscribe();
        loop {
            tokio::select! {
                permit = self.ready_sem.acquire() => match permit {
                    Ok(permit) => {
                        permit.forget();
                        // An `empty` may have raced us out of the payload
                        // this permit tracked.
                        match self.ready.lock().pop_front() {
                            Some(msg) => return Some(msg),
                            None => continue,
                        }
                    }
                    Err(_) => return None,
                },
                maybe = self.backend.read() => match maybe {
                    Some(buf) => match Message::decode(buf) {
                        Ok(msg) => return Some(msg),
                        Err(err) => {
                            error!(
                                topic = %self.topic_name,
                                channel = %self.name,
                                %err,
                                "failed to decode message from backend"
                            );
                        }
                    },
                    None => return None,
                },
                _ = exit.recv() => return None,
            }
        }
    }

    /// Mark a message as delivered to `client_id`, incrementing its attempt
    /// counter and arming the redelivery timer.
    ///
    /// # Errors
    /// Fails if shutdown has begun or the identifier is already in flight.
    pub fn start_in_flight(
        &self,
        msg: &mut Message,
        client_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        msg.attempts = msg.attempts.saturating_add(1);
        let deadline = Instant::now() + timeout;
        {
            let mut st = self.state.lock();
            if st.in_flight.contains_key(&msg.id) {
                return Err(BrokerError::AlreadyInFlight);
            }
            st.in_flight.insert(msg.id, InFlight { msg: msg.clone(), client_id, deadline });
        }
        self.in_flight_notify.notify_one();
        Ok(())
    }

    /// Acknowledge a delivered message, removing every trace of it.
    ///
    /// # Errors
    /// Fails if the identifier is not in flight or belongs to another
    /// client.
    pub fn finish_message(&self, client_id: u64, id: MessageId) -> Result<()> {
        self.pop_in_flight(client_id, id).map(|_| ())
    }

    /// Return a delivered message to the queue, immediately (`delay` zero)
    /// or after parking in the deferred queue until `now + delay`.
    ///
    /// # Errors
    /// Fails if the identifier is not in flight, belongs to another client,
    /// or an immediate requeue cannot reach the backend.
    pub async fn requeue_message(
        &self,
        client_id: u64,
        id: MessageId,
        delay: Duration,
    ) -> Result<()> {
        let msg = self.pop_in_flight(client_id, id)?;
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        if delay.is_zero() {
            return self.enqueue(msg).await;
        }
        {
            let mut st = self.state.lock();
            let seq = st.seq;
            st.seq += 1;
            st.deferred.push(Reverse(Deferred { ready_at: Instant::now() + delay, seq, msg }));
        }
        self.deferred_notify.notify_one();
        Ok(())
    }

    /// Extend the in-flight deadline of a delivered message by a full
    /// timeout.
    ///
    /// # Errors
    /// Fails if the identifier is not in flight or belongs to another
    /// client.
    pub fn touch_message(&self, client_id: u64, id: MessageId, timeout: Duration) -> Result<()> {
        {
            let mut st = self.state.lock();
            let entry = st.in_flight.get_mut(&id).ok_or(BrokerError::NotInFlight)?;
            if entry.client_id != client_id {
                return Err(BrokerError::NotOwned);
            }
            entry.deadline = Instant::now() + timeout;
        }
        self.in_flight_notify.notify_one();
        Ok(())
    }

    fn pop_in_flight(&self, client_id: u64, id: MessageId) -> Result<Message> {
        let mut st = self.state.lock();
        match st.in_flight.get(&id) {
            None => Err(BrokerError::NotInFlight),
            Some(entry) if entry.client_id != client_id => Err(BrokerError::NotOwned),
            Some(_) => Ok(st.in_flight.remove(&id).expect("entry just observed").msg),
        }
    }

    /// Discard everything: ready queue, backend, in-flight, deferred.
    ///
    /// # Errors
    /// Fails if backend storage cannot be removed.
    pub async fn empty(&self) -> Result<()> {
        {
            let mut st = self.state.lock();
            st.in_flight.clear();
            st.deferred.clear();
        }
        let drained = {
            let mut queue = self.ready.lock();
            let drained = queue.len();
            queue.clear();
            drained
        };
        self.burn_permits(drained);
        self.backend.empty().await?;
        Ok(())
    }

    /// Retire permits for messages drained out of the ready queue. Permits
    /// already held by in-progress dequeues self-correct: those dequeues
    /// pop nothing and retry.
    fn burn_permits(&self, count: usize) {
        for _ in 0..count {
            match self.ready_sem.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
    }

    /// Stop handing messages to subscribers. Messages keep accumulating.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pause_notify.notify_waiters();
    }

    /// Resume delivery.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.pause_notify.notify_waiters();
    }

    /// Whether delivery is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Completes when the pause flag flips; subscriber pumps re-check on
    /// wake.
    pub fn pause_signal(&self) -> Notified<'_> {
        self.pause_notify.notified()
    }

    /// Register a subscriber.
    ///
    /// # Errors
    /// Fails once shutdown has begun.
    pub fn add_client(&self, client_id: u64, remote: String) -> Result<()> {
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        self.clients.write().insert(client_id, remote);
        Ok(())
    }

    /// Remove a subscriber. Returns `true` when the channel is ephemeral
    /// and this was its last client, in which case the caller deletes the
    /// channel through the owning topic.
    pub fn remove_client(&self, client_id: u64) -> bool {
        let mut clients = self.clients.write();
        clients.remove(&client_id);
        self.ephemeral && clients.is_empty()
    }

    /// Number of subscribed clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Messages awaiting delivery, in memory plus on the backend.
    pub fn depth(&self) -> i64 {
        self.memory_depth() + self.backend.depth()
    }

    /// Messages on the backend alone.
    pub fn backend_depth(&self) -> i64 {
        self.backend.depth()
    }

    fn memory_depth(&self) -> i64 {
        self.ready.lock().len() as i64
    }

    /// Messages delivered and not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Messages parked for future delivery.
    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Total messages accepted.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Total requeues requested by clients.
    pub fn requeue_count(&self) -> u64 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    /// Total in-flight timeouts.
    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    /// Flush to backend and stop, retaining messages.
    ///
    /// # Errors
    /// Fails if already exiting or the final flush fails.
    pub async fn close(&self) -> Result<()> {
        self.exit(false).await
    }

    /// Discard all messages and stop.
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
        info!(topic = %self.topic_name, channel = %self.name, deleted, "closing channel");

        let _ = self.exit_tx.send(());
        self.ready_sem.close();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        if deleted {
            let _ = self.notifier.send(RegistrationEvent::ChannelDeleted {
                topic: self.topic_name.clone(),
                channel: self.name.clone(),
            });
            self.empty().await?;
        } else {
            self.flush().await?;
        }
        self.backend.close().await?;
        Ok(())
    }

    /// Persist memory, in-flight, and deferred messages to the backend.
    async fn flush(&self) -> Result<()> {
        if self.ephemeral {
            return Ok(());
        }
        let mut leftover = Vec::new();
        {
            let mut queue = self.ready.lock();
            leftover.extend(queue.drain(..));
        }
        self.burn_permits(leftover.len());
        {
            let mut st = self.state.lock();
            leftover.extend(st.in_flight.drain().map(|(_, e)| e.msg));
            leftover.extend(std::mem::take(&mut st.deferred).into_sorted_vec().into_iter().map(
                |Reverse(d)| d.msg,
            ));
        }
        if !leftover.is_empty() {
            info!(
                topic = %self.topic_name,
                channel = %self.name,
                count = leftover.len(),
                "flushing messages to backend"
            );
        }
        for msg in leftover {
            if let Err(err) = self.backend.put(msg.encode()).await {
                error!(channel = %self.name, %err, "failed to flush message to backend");
            }
        }
        Ok(())
    }

    /// Redelivers messages whose in-flight deadline has expired. Sleeps
    /// until the earliest outstanding deadline, no shorter than the scan
    /// floor.
    async fn in_flight_monitor(self: Arc<Self>) {
        let mut exit = self.exit_tx.subscribe();
        loop {
            let next = {
                let st = self.state.lock();
                st.in_flight.values().map(|e| e.deadline).min()
            };
            let sleep_for = next.map(|d| d.saturating_duration_since(Instant::now()).max(SCAN_FLOOR));
            tokio::select! {
                _ = sleep_or_park(sleep_for) => self.requeue_expired().await,
                _ = self.in_flight_notify.notified() => continue,
                _ = exit.recv() => break,
            }
        }
    }

    async fn requeue_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Message> = {
            let mut st = self.state.lock();
            let ids: Vec<MessageId> = st
                .in_flight
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| st.in_flight.remove(&id)).map(|e| e.msg).collect()
        };
        for msg in expired {
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            debug!(
                topic = %self.topic_name,
                channel = %self.name,
                id = %msg.id,
                attempts = msg.attempts,
                "in-flight timeout, requeueing"
            );
            if let Err(err) = self.enqueue(msg).await {
                error!(channel = %self.name, %err, "failed to requeue expired message");
            }
        }
    }

    /// Moves deferred messages whose ready time has passed back to the
    /// queue.
    async fn deferred_monitor(self: Arc<Self>) {
        let mut exit = self.exit_tx.subscribe();
        loop {
            let next = {
                let st = self.state.lock();
                st.deferred.peek().map(|Reverse(d)| d.ready_at)
            };
            let sleep_for = next.map(|d| d.saturating_duration_since(Instant::now()).max(SCAN_FLOOR));
            tokio::select! {
                _ = sleep_or_park(sleep_for) => self.requeue_ready().await,
                _ = self.deferred_notify.notified() => continue,
                _ = exit.recv() => break,
            }
        }
    }

    async fn requeue_ready(&self) {
        let now = Instant::now();
        let ready: Vec<Message> = {
            let mut st = self.state.lock();
            let mut ready = Vec::new();
            while st.deferred.peek().map_or(false, |Reverse(d)| d.ready_at <= now) {
                if let Some(Reverse(d)) = st.deferred.pop() {
                    ready.push(d.msg);
                }
            }
            ready
        };
        for msg in ready {
            if let Err(err) = self.enqueue(msg).await {
                error!(channel = %self.name, %err, "failed to requeue deferred message");
            }
        }
    }
}

/// Sleep for the given duration, or forever when there is nothing to wait
/// for (a notify wakes the monitor when work arrives).
async fn sleep_or_park(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_opts(data_path: std::path::PathBuf, mem_queue_size: usize) -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig { data_path, mem_queue_size, ..Default::default() })
    }

    async fn test_channel(name: &str, mem_queue_size: usize) -> (Arc<Channel>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let ch = Channel::new(
            "t".into(),
            name.into(),
            test_opts(dir.path().to_path_buf(), mem_queue_size),
            notify_tx,
        )
        .await
        .unwrap();
        (ch, dir)
    }

    fn msg(body: &'static [u8]) -> Message {
        Message::new(MessageId::random(), Bytes::from_static(body))
    }

    #[tokio::test(start_paused = true)]
    async fn finish_leaves_no_trace() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_secs(60)).unwrap();
        assert_eq!(m.attempts, 1);
        assert_eq!(ch.in_flight_count(), 1);

        ch.finish_message(1, m.id).unwrap();
        assert_eq!(ch.in_flight_count(), 0);
        assert_eq!(ch.deferred_count(), 0);
        assert_eq!(ch.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_message_is_redelivered_with_incremented_attempts() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        let id = m.id;
        ch.start_in_flight(&mut m, 1, Duration::from_millis(200)).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut again = ch.next_message().await.unwrap();
        assert_eq!(again.id, id);
        ch.start_in_flight(&mut again, 1, Duration::from_secs(60)).unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(ch.timeout_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_with_delay_reappears_after_delay() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        let id = m.id;
        ch.start_in_flight(&mut m, 7, Duration::from_secs(60)).unwrap();
        ch.requeue_message(7, id, Duration::from_millis(100)).await.unwrap();
        assert_eq!(ch.deferred_count(), 1);
        assert_eq!(ch.in_flight_count(), 0);

        let started = Instant::now();
        let mut again = ch.next_message().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(again.id, id);
        ch.start_in_flight(&mut again, 7, Duration::from_secs(60)).unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_requeue_rejoins_queue() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_secs(60)).unwrap();
        ch.requeue_message(1, m.id, Duration::ZERO).await.unwrap();
        assert_eq!(ch.in_flight_count(), 0);
        assert_eq!(ch.next_message().await.unwrap().id, m.id);
    }

    #[tokio::test(start_paused = true)]
    async fn identifier_lives_in_one_set_at_a_time() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_secs(60)).unwrap();
        // Delivering the same identifier twice is a tracking error.
        assert!(matches!(
            ch.start_in_flight(&mut m.clone(), 2, Duration::from_secs(60)),
            Err(BrokerError::AlreadyInFlight)
        ));

        ch.requeue_message(1, m.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ch.in_flight_count(), 0);
        assert_eq!(ch.deferred_count(), 1);
        assert!(matches!(ch.finish_message(1, m.id), Err(BrokerError::NotInFlight)));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_checks_ownership() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_secs(60)).unwrap();
        assert!(matches!(ch.finish_message(2, m.id), Err(BrokerError::NotOwned)));
        ch.finish_message(1, m.id).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_the_deadline() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.put_message(msg(b"a")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_millis(300)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        ch.touch_message(1, m.id, Duration::from_millis(300)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Without the touch this would have expired by now.
        assert_eq!(ch.in_flight_count(), 1);
        ch.finish_message(1, m.id).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ephemeral_overflow_drops_oldest() {
        let (ch, _dir) = test_channel("c#ephemeral", 2).await;
        assert!(ch.is_ephemeral());

        let first = msg(b"first");
        let first_id = first.id;
        ch.put_message(first).await.unwrap();
        ch.put_message(msg(b"second")).await.unwrap();
        ch.put_message(msg(b"third")).await.unwrap();

        assert_eq!(ch.depth(), 2);
        assert_eq!(ch.backend_depth(), 0);
        let got = ch.next_message().await.unwrap();
        assert_ne!(got.id, first_id);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_overflow_spills_to_backend() {
        let (ch, _dir) = test_channel("c", 1).await;
        ch.put_message(msg(b"one")).await.unwrap();
        ch.put_message(msg(b"two")).await.unwrap();
        assert_eq!(ch.backend_depth(), 1);

        // Memory and backend interleave at the dequeuer's discretion; both
        // messages must surface exactly once.
        let a = ch.next_message().await.unwrap();
        let b = ch.next_message().await.unwrap();
        let mut bodies = vec![a.body, b.body];
        bodies.sort();
        assert_eq!(bodies, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_discards_all_sets() {
        let (ch, _dir) = test_channel("c", 1).await;
        ch.put_message(msg(b"one")).await.unwrap();
        ch.put_message(msg(b"two")).await.unwrap();

        let mut m = ch.next_message().await.unwrap();
        ch.start_in_flight(&mut m, 1, Duration::from_secs(60)).unwrap();

        ch.empty().await.unwrap();
        assert_eq!(ch.depth(), 0);
        assert_eq!(ch.in_flight_count(), 0);
        assert_eq!(ch.deferred_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn put_after_close_fails() {
        let (ch, _dir) = test_channel("c", 10).await;
        ch.close().await.unwrap();
        assert!(matches!(ch.put_message(msg(b"late")).await, Err(BrokerError::Exiting)));
    }
}
