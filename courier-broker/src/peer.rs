//! Broker-side connection to one directory server.
//!
//! A `PeerLink` connects lazily: the first `command` dials, writes the V2
//! magic, spawns the reader and router tasks, and invokes the connect
//! callback (which typically identifies and triggers a registration
//! resync). Any read or write error disconnects the link and fails every
//! in-flight transaction; the next `command` reconnects.
//!
//! Requests are pipelined. The router task is the sole writer of the
//! socket: it serializes each request, appends its transaction to a FIFO,
//! and matches responses to the oldest pending transaction — correct
//! because the directory answers strictly in order on one connection.
//! Heartbeat frames are consumed out-of-band and never matched.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::protocol::{
    read_response, unpack_response, DEFAULT_CLIENT_TIMEOUT, FRAME_TYPE_RESPONSE, HEARTBEAT,
    MAGIC_V2,
};
use courier_core::Command;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};

/// No connection; the next `command` will dial.
pub const STATE_DISCONNECTED: i32 = 0;
/// A dial is in progress.
pub const STATE_CONNECTING: i32 = 1;
/// The link is usable.
pub const STATE_CONNECTED: i32 = 2;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Invoked every time the link (re)connects, before the triggering
/// `command` proceeds.
pub type ConnectCallback =
    Arc<dyn Fn(Arc<PeerLink>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`ConnectCallback`].
pub fn boxed_callback<F, Fut>(f: F) -> ConnectCallback
where
    F: Fn(Arc<PeerLink>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |link: Arc<PeerLink>| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(f(link))
    })
}

struct Transaction {
    cmd: Command,
    done: oneshot::Sender<Result<(i32, Bytes)>>,
}

/// A lazily-connected, auto-reconnecting client for one directory.
pub struct PeerLink {
    addr: String,
    state: AtomicI32,
    callback: ConnectCallback,
    txn_tx: RwLock<Option<mpsc::Sender<Transaction>>>,
    conn_exit: Mutex<Option<broadcast::Sender<()>>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl PeerLink {
    /// Create a link to `addr`. Nothing is dialed until the first
    /// [`connect`](Self::connect) or [`command`](Self::command).
    pub fn new(addr: impl Into<String>, callback: ConnectCallback) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            state: AtomicI32::new(STATE_DISCONNECTED),
            callback,
            txn_tx: RwLock::new(None),
            conn_exit: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
        })
    }

    /// The directory address this link dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current connection state.
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    /// When the last out-of-band heartbeat arrived.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock()
    }

    /// Perform one round-trip: connect if necessary, transmit, and wait for
    /// the matching response `(frame_type, payload)`.
    ///
    /// # Errors
    /// Fails with [`BrokerError::Disconnected`] (or the dial error) if the
    /// link is unusable; pending transactions are failed on disconnect and
    /// the next call reconnects.
    pub async fn command(self: &Arc<Self>, cmd: Command) -> Result<(i32, Bytes)> {
        self.connect().await?;
        let tx = self
            .txn_tx
            .read()
            .clone()
            .ok_or(BrokerError::Disconnected)?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Transaction { cmd, done: done_tx })
            .await
            .map_err(|_| BrokerError::Disconnected)?;
        done_rx.await.map_err(|_| BrokerError::Disconnected)?
    }

    /// Dial if disconnected. Runs the connect callback exactly once per
    /// successful (re)connection.
    ///
    /// # Errors
    /// Fails if the dial or magic write fails; the link returns to
    /// disconnected and may be retried.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_DISCONNECTED,
                STATE_CONNECTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        info!(peer = %self.addr, "connecting to directory");
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                return Err(err.into());
            }
            Err(_) => {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                return Err(BrokerError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", self.addr),
                )));
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();

        match timeout(WRITE_TIMEOUT, write_half.write_all(MAGIC_V2)).await {
            Ok(Ok(())) => {}
            _ => {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                return Err(BrokerError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("magic write to {} failed", self.addr),
                )));
            }
        }

        let (txn_tx, txn_rx) = mpsc::channel(16);
        let (data_tx, data_rx) = mpsc::channel(1);
        let (exit_tx, _) = broadcast::channel(1);
        *self.txn_tx.write() = Some(txn_tx);
        *self.conn_exit.lock() = Some(exit_tx.clone());
        self.state.store(STATE_CONNECTED, Ordering::SeqCst);

        tokio::spawn(Arc::clone(self).read_loop(read_half, data_tx, exit_tx.subscribe()));
        tokio::spawn(Arc::clone(self).router(write_half, txn_rx, data_rx, exit_tx));

        (self.callback)(Arc::clone(self)).await;
        Ok(())
    }

    /// Tear down the connection, failing every pending transaction.
    pub fn disconnect(&self) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::SeqCst) == STATE_DISCONNECTED {
            return;
        }
        info!(peer = %self.addr, "disconnected from directory");
        *self.txn_tx.write() = None;
        if let Some(exit) = self.conn_exit.lock().take() {
            let _ = exit.send(());
        }
    }

    /// Reads length-prefixed responses under the read deadline and feeds
    /// them to the router. Any failure tears the link down.
    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        data_tx: mpsc::Sender<Bytes>,
        mut exit: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                res = timeout(DEFAULT_CLIENT_TIMEOUT, read_response(&mut read_half)) => {
                    let data = match res {
                        Ok(Ok(data)) => data,
                        Ok(Err(err)) => {
                            debug!(peer = %self.addr, %err, "read error");
                            self.disconnect();
                            return;
                        }
                        Err(_) => {
                            warn!(peer = %self.addr, "read deadline exceeded");
                            self.disconnect();
                            return;
                        }
                    };
                    if data_tx.send(data).await.is_err() {
                        return;
                    }
                }
                _ = exit.recv() => return,
            }
        }
    }

    /// Owns the socket writer and the pending-transaction FIFO.
    async fn router(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut txn_rx: mpsc::Receiver<Transaction>,
        mut data_rx: mpsc::Receiver<Bytes>,
        exit_tx: broadcast::Sender<()>,
    ) {
        let mut exit = exit_tx.subscribe();
        let mut pending: VecDeque<Transaction> = VecDeque::new();

        loop {
            tokio::select! {
                Some(txn) = txn_rx.recv() => {
                    match timeout(WRITE_TIMEOUT, txn.cmd.write_to(&mut write_half)).await {
                        Ok(Ok(())) => pending.push_back(txn),
                        _ => {
                            let _ = txn.done.send(Err(BrokerError::Disconnected));
                            self.disconnect();
                            break;
                        }
                    }
                }
                Some(buf) = data_rx.recv() => {
                    let (frame_type, payload) = match unpack_response(buf) {
                        Ok(parts) => parts,
                        Err(err) => {
                            warn!(peer = %self.addr, %err, "malformed response");
                            self.disconnect();
                            break;
                        }
                    };
                    if frame_type == FRAME_TYPE_RESPONSE && payload == HEARTBEAT {
                        debug!(peer = %self.addr, "heartbeat");
                        *self.last_heartbeat.lock() = Some(Instant::now());
                        continue;
                    }
                    match pending.pop_front() {
                        Some(txn) => {
                            let _ = txn.done.send(Ok((frame_type, payload)));
                        }
                        None => {
                            warn!(peer = %self.addr, "response with no pending transaction");
                            self.disconnect();
                            break;
                        }
                    }
                }
                _ = exit.recv() => break,
            }
        }

        // Drain and fail everything still outstanding.
        txn_rx.close();
        while let Ok(txn) = txn_rx.try_recv() {
            let _ = txn.done.send(Err(BrokerError::Disconnected));
        }
        for txn in pending {
            let _ = txn.done.send(Err(BrokerError::Disconnected));
        }
        debug!(peer = %self.addr, "router exiting");
    }
}

impl fmt::Display for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
