//! Client-facing TCP protocol.
//!
//! Clients connect, write the `"  V2"` magic, and speak newline-terminated
//! commands with framed responses. Each connection runs two tasks: an
//! IOLoop that parses and executes commands, and a message pump that
//! delivers channel messages (gated on the client's `RDY` count and the
//! channel's pause flag) and emits periodic heartbeats.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use courier_core::protocol::{
    send_framed_response, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, HEARTBEAT,
    MAGIC_V2,
};
use courier_core::{names, ClientError, Message, MessageId};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::channel::Channel;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;
type Reader = BufReader<OwnedReadHalf>;

/// Accept client connections until broker shutdown.
///
/// # Errors
/// Fails only if the listener itself breaks; per-connection errors are
/// logged and do not stop the accept loop.
pub async fn serve(broker: Arc<Broker>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "client listener started");
    let mut exit = broker.exit_subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    let broker = Arc::clone(&broker);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(broker, stream, remote).await {
                            debug!(client = %remote, %err, "connection ended");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = exit.recv() => break,
        }
    }
    info!(%addr, "client listener stopped");
    Ok(())
}

struct ClientConn {
    id: u64,
    remote: SocketAddr,
    channel: parking_lot::RwLock<Option<Arc<Channel>>>,
    ready_count: AtomicI64,
    closing: AtomicBool,
    state_notify: Notify,
}

impl ClientConn {
    fn new(id: u64, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            channel: parking_lot::RwLock::new(None),
            ready_count: AtomicI64::new(0),
            closing: AtomicBool::new(false),
            state_notify: Notify::new(),
        }
    }

    fn subscribed(&self) -> Option<Arc<Channel>> {
        self.channel.read().clone()
    }
}

async fn handle_connection(
    broker: Arc<Broker>,
    stream: TcpStream,
    remote: SocketAddr,
) -> Result<()> {
    let cfg = Arc::clone(broker.config());
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(16 * 1024, read_half);
    let writer: SharedWriter = Arc::new(AsyncMutex::new(write_half));

    let mut magic = [0u8; 4];
    match timeout(cfg.client_read_timeout(), reader.read_exact(&mut magic)).await {
        Ok(Ok(_)) => {}
        _ => return Ok(()),
    }
    if &magic != MAGIC_V2 {
        warn!(client = %remote, ?magic, "bad protocol magic");
        let _ = send_frame(&writer, FRAME_TYPE_ERROR, b"E_BAD_PROTOCOL unsupported magic").await;
        return Ok(());
    }

    let client = Arc::new(ClientConn::new(broker.next_client_id(), remote));
    info!(client = %remote, id = client.id, "new client");

    let (conn_exit_tx, _) = broadcast::channel(1);
    let pump = tokio::spawn(message_pump(
        Arc::clone(&cfg),
        Arc::clone(&client),
        Arc::clone(&writer),
        conn_exit_tx.subscribe(),
    ));

    let result = io_loop(&broker, &cfg, &client, &mut reader, &writer).await;

    let _ = conn_exit_tx.send(());
    let _ = pump.await;
    client_close(&broker, &client).await;
    info!(client = %remote, id = client.id, "client closed");
    result
}

async fn io_loop(
    broker: &Arc<Broker>,
    cfg: &Arc<BrokerConfig>,
    client: &Arc<ClientConn>,
    reader: &mut Reader,
    writer: &SharedWriter,
) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = match timeout(
            cfg.client_read_timeout(),
            tokio::io::AsyncBufReadExt::read_line(reader, &mut line),
        )
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                debug!(client = %client.remote, "read deadline exceeded");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let params: Vec<&str> = trimmed.split(' ').collect();

        match exec(broker, cfg, client, reader, &params).await {
            Ok(Some(response)) => {
                send_frame(writer, FRAME_TYPE_RESPONSE, &response).await?;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(client = %client.remote, %err, "client error");
                send_frame(writer, FRAME_TYPE_ERROR, err.to_string().as_bytes()).await?;
                if err.is_fatal() {
                    return Ok(());
                }
            }
        }
    }
}

type ExecResult = std::result::Result<Option<Bytes>, ClientError>;

async fn exec(
    broker: &Arc<Broker>,
    cfg: &Arc<BrokerConfig>,
    client: &Arc<ClientConn>,
    reader: &mut Reader,
    params: &[&str],
) -> ExecResult {
    match params[0] {
        "SUB" => sub(broker, client, params).await,
        "PUB" => publish(broker, cfg, reader, params).await,
        "MPUB" => mpublish(broker, cfg, reader, params).await,
        "RDY" => ready(cfg, client, params),
        "FIN" => finish(client, params),
        "REQ" => requeue(cfg, client, params).await,
        "TOUCH" => touch(cfg, client, params),
        "CLS" => close(client),
        "NOP" => Ok(None),
        other => Err(ClientError::fatal("E_INVALID", format!("invalid command {other}"))),
    }
}

async fn sub(broker: &Arc<Broker>, client: &Arc<ClientConn>, params: &[&str]) -> ExecResult {
    if client.subscribed().is_some() {
        return Err(ClientError::fatal("E_INVALID", "cannot SUB twice"));
    }
    let (topic_name, channel_name) = match params {
        [_, topic, channel] => (*topic, *channel),
        _ => return Err(ClientError::fatal("E_INVALID", "SUB insufficient number of params")),
    };
    if !names::is_valid_topic_name(topic_name) {
        return Err(ClientError::fatal(
            "E_BAD_TOPIC",
            format!("SUB topic name '{topic_name}' is not valid"),
        ));
    }
    if !names::is_valid_channel_name(channel_name) {
        return Err(ClientError::fatal(
            "E_BAD_CHANNEL",
            format!("SUB channel name '{channel_name}' is not valid"),
        ));
    }

    let topic = broker
        .get_topic(topic_name)
        .await
        .map_err(|err| ClientError::fatal("E_SUB_FAILED", err.to_string()))?;
    let channel = topic
        .get_channel(channel_name)
        .await
        .map_err(|err| ClientError::fatal("E_SUB_FAILED", err.to_string()))?;
    channel
        .add_client(client.id, client.remote.to_string())
        .map_err(|err| ClientError::fatal("E_SUB_FAILED", err.to_string()))?;

    *client.channel.write() = Some(channel);
    client.state_notify.notify_waiters();
    Ok(Some(Bytes::from_static(b"OK")))
}

async fn publish(
    broker: &Arc<Broker>,
    cfg: &Arc<BrokerConfig>,
    reader: &mut Reader,
    params: &[&str],
) -> ExecResult {
    let topic_name = match params {
        [_, topic] => *topic,
        _ => return Err(ClientError::fatal("E_INVALID", "PUB insufficient number of params")),
    };
    if !names::is_valid_topic_name(topic_name) {
        return Err(ClientError::fatal(
            "E_BAD_TOPIC",
            format!("PUB topic name '{topic_name}' is not valid"),
        ));
    }

    let body_len = read_body_len(reader).await?;
    if body_len == 0 {
        return Err(ClientError::non_fatal("E_BAD_MESSAGE", "PUB invalid message body size 0"));
    }
    if body_len > cfg.max_msg_size {
        return Err(ClientError::non_fatal(
            "E_BAD_MESSAGE",
            format!("PUB message too big {body_len} > {}", cfg.max_msg_size),
        ));
    }
    let body = read_body(reader, body_len).await?;

    let topic = broker
        .get_topic(topic_name)
        .await
        .map_err(|err| ClientError::non_fatal("E_PUB_FAILED", err.to_string()))?;
    topic
        .put_message(Message::new(MessageId::random(), body))
        .await
        .map_err(|err| ClientError::non_fatal("E_PUB_FAILED", err.to_string()))?;
    Ok(Some(Bytes::from_static(b"OK")))
}

async fn mpublish(
    broker: &Arc<Broker>,
    cfg: &Arc<BrokerConfig>,
    reader: &mut Reader,
    params: &[&str],
) -> ExecResult {
    let topic_name = match params {
        [_, topic] => *topic,
        _ => return Err(ClientError::fatal("E_INVALID", "MPUB insufficient number of params")),
    };
    if !names::is_valid_topic_name(topic_name) {
        return Err(ClientError::fatal(
            "E_BAD_TOPIC",
            format!("MPUB topic name '{topic_name}' is not valid"),
        ));
    }

    let body_len = read_body_len(reader).await?;
    if body_len == 0 || body_len > cfg.max_body_size {
        return Err(ClientError::non_fatal(
            "E_BAD_BODY",
            format!("MPUB invalid body size {body_len}"),
        ));
    }
    let mut body = read_body(reader, body_len).await?;
    if body.len() < 4 {
        return Err(ClientError::non_fatal("E_BAD_BODY", "MPUB body too small"));
    }
    let count = body.get_u32();
    if count == 0 {
        return Err(ClientError::non_fatal("E_BAD_BODY", "MPUB invalid message count 0"));
    }

    let mut messages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if body.len() < 4 {
            return Err(ClientError::non_fatal("E_BAD_MESSAGE", "MPUB message truncated"));
        }
        let len = body.get_u32();
        if len == 0 || len as usize > body.len() || len > cfg.max_msg_size {
            return Err(ClientError::non_fatal(
                "E_BAD_MESSAGE",
                format!("MPUB invalid message body size {len}"),
            ));
        }
        messages.push(Message::new(MessageId::random(), body.split_to(len as usize)));
    }

    let topic = broker
        .get_topic(topic_name)
        .await
        .map_err(|err| ClientError::non_fatal("E_MPUB_FAILED", err.to_string()))?;
    topic
        .put_messages(messages)
        .await
        .map_err(|err| ClientError::non_fatal("E_MPUB_FAILED", err.to_string()))?;
    Ok(Some(Bytes::from_static(b"OK")))
}

fn ready(cfg: &Arc<BrokerConfig>, client: &Arc<ClientConn>, params: &[&str]) -> ExecResult {
    if client.subscribed().is_none() {
        return Err(ClientError::fatal("E_INVALID", "RDY before SUB"));
    }
    let count = params
        .get(1)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ClientError::fatal("E_INVALID", "RDY could not parse count"))?;
    if count < 0 || count > cfg.max_ready_count {
        return Err(ClientError::fatal(
            "E_INVALID",
            format!("RDY count {count} out of range 0..{}", cfg.max_ready_count),
        ));
    }
    client.ready_count.store(count, Ordering::SeqCst);
    client.state_notify.notify_waiters();
    Ok(None)
}

fn finish(client: &Arc<ClientConn>, params: &[&str]) -> ExecResult {
    let (channel, id) = subscribed_message_params(client, "FIN", params)?;
    channel
        .finish_message(client.id, id)
        .map_err(|err| ClientError::non_fatal("E_FIN_FAILED", err.to_string()))?;
    Ok(None)
}

async fn requeue(
    cfg: &Arc<BrokerConfig>,
    client: &Arc<ClientConn>,
    params: &[&str],
) -> ExecResult {
    let (channel, id) = subscribed_message_params(client, "REQ", params)?;
    let delay_ms = params
        .get(2)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ClientError::non_fatal("E_INVALID", "REQ could not parse delay"))?;
    let delay = Duration::from_millis(delay_ms);
    if delay > cfg.max_requeue_delay {
        return Err(ClientError::non_fatal(
            "E_INVALID",
            format!("REQ delay {delay_ms}ms out of range"),
        ));
    }
    channel
        .requeue_message(client.id, id, delay)
        .await
        .map_err(|err| ClientError::non_fatal("E_REQ_FAILED", err.to_string()))?;
    Ok(None)
}

fn touch(cfg: &Arc<BrokerConfig>, client: &Arc<ClientConn>, params: &[&str]) -> ExecResult {
    let (channel, id) = subscribed_message_params(client, "TOUCH", params)?;
    channel
        .touch_message(client.id, id, cfg.msg_timeout)
        .map_err(|err| ClientError::non_fatal("E_TOUCH_FAILED", err.to_string()))?;
    Ok(None)
}

fn close(client: &Arc<ClientConn>) -> ExecResult {
    if client.subscribed().is_none() {
        return Err(ClientError::fatal("E_INVALID", "CLS before SUB"));
    }
    client.closing.store(true, Ordering::SeqCst);
    client.ready_count.store(0, Ordering::SeqCst);
    client.state_notify.notify_waiters();
    Ok(Some(Bytes::from_static(b"CLOSE_WAIT")))
}

fn subscribed_message_params(
    client: &Arc<ClientConn>,
    command: &str,
    params: &[&str],
) -> std::result::Result<(Arc<Channel>, MessageId), ClientError> {
    let channel = client
        .subscribed()
        .ok_or_else(|| ClientError::fatal("E_INVALID", format!("{command} before SUB")))?;
    let id = params
        .get(1)
        .and_then(|s| MessageId::parse(s).ok())
        .ok_or_else(|| {
            ClientError::non_fatal("E_BAD_MESSAGE", format!("{command} bad message id"))
        })?;
    Ok((channel, id))
}

async fn read_body_len(reader: &mut Reader) -> std::result::Result<u32, ClientError> {
    reader
        .read_u32()
        .await
        .map_err(|err| ClientError::fatal("E_BAD_BODY", format!("failed to read body size: {err}")))
}

async fn read_body(reader: &mut Reader, len: u32) -> std::result::Result<Bytes, ClientError> {
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|err| ClientError::fatal("E_BAD_BODY", format!("failed to read body: {err}")))?;
    Ok(Bytes::from(buf))
}

/// Deliver messages and heartbeats to one client.
async fn message_pump(
    cfg: Arc<BrokerConfig>,
    client: Arc<ClientConn>,
    writer: SharedWriter,
    mut conn_exit: broadcast::Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + cfg.heartbeat_interval,
        cfg.heartbeat_interval,
    );

    loop {
        let channel = client.subscribed();
        let deliverable = channel.as_ref().map_or(false, |ch| !ch.is_paused())
            && client.ready_count.load(Ordering::SeqCst) > 0
            && !client.closing.load(Ordering::SeqCst);

        match (channel, deliverable) {
            (Some(ch), true) => {
                tokio::select! {
                    maybe = ch.next_message() => match maybe {
                        Some(mut msg) => {
                            if let Err(err) =
                                ch.start_in_flight(&mut msg, client.id, cfg.msg_timeout)
                            {
                                warn!(
                                    client = %client.remote,
                                    id = %msg.id,
                                    %err,
                                    "failed to track delivery"
                                );
                                continue;
                            }
                            client.ready_count.fetch_sub(1, Ordering::SeqCst);
                            if let Err(err) =
                                send_frame(&writer, FRAME_TYPE_MESSAGE, &msg.encode()).await
                            {
                                debug!(client = %client.remote, %err, "delivery write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        if send_frame(&writer, FRAME_TYPE_RESPONSE, HEARTBEAT).await.is_err() {
                            break;
                        }
                    }
                    _ = client.state_notify.notified() => continue,
                    _ = ch.pause_signal() => continue,
                    _ = conn_exit.recv() => break,
                }
            }
            (Some(ch), false) => {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if send_frame(&writer, FRAME_TYPE_RESPONSE, HEARTBEAT).await.is_err() {
                            break;
                        }
                    }
                    _ = client.state_notify.notified() => continue,
                    _ = ch.pause_signal() => continue,
                    _ = conn_exit.recv() => break,
                }
            }
            (None, _) => {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if send_frame(&writer, FRAME_TYPE_RESPONSE, HEARTBEAT).await.is_err() {
                            break;
                        }
                    }
                    _ = client.state_notify.notified() => continue,
                    _ = conn_exit.recv() => break,
                }
            }
        }
    }
    debug!(client = %client.remote, "message pump exiting");
}

async fn client_close(broker: &Arc<Broker>, client: &Arc<ClientConn>) {
    let channel = client.channel.write().take();
    if let Some(ch) = channel {
        let last_ephemeral_client = ch.remove_client(client.id);
        if last_ephemeral_client {
            if let Ok(topic) = broker.get_existing_topic(ch.topic_name()) {
                if let Err(err) = topic.delete_existing_channel(ch.name()).await {
                    debug!(channel = %ch.name(), %err, "ephemeral channel cleanup failed");
                }
            }
        }
    }
}

async fn send_frame(writer: &SharedWriter, frame_type: i32, data: &[u8]) -> Result<()> {
    let mut w = writer.lock().await;
    match timeout(WRITE_TIMEOUT, send_framed_response(&mut *w, frame_type, data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(BrokerError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
