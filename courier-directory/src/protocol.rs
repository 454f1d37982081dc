//! Broker-facing TCP protocol.
//!
//! Connections open with a 4-byte magic selecting the response framing:
//! `"  V2"` clients get framed responses (`size || frame_type || data`),
//! legacy `"  V1"` clients get unframed ones (`size || data`). Both speak
//! the same newline-terminated command set: `IDENTIFY`, `REGISTER`,
//! `UNREGISTER`, `PING`. Fatal protocol violations emit an error frame and
//! close the connection; bad arguments emit an error frame and keep it
//! open. On disconnect every registration the producer held is dropped,
//! removing emptied ephemeral channel registrations entirely.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::protocol::{
    send_framed_response, send_response, DEFAULT_CLIENT_TIMEOUT, FRAME_TYPE_ERROR,
    FRAME_TYPE_RESPONSE, MAGIC_V1, MAGIC_V2,
};
use courier_core::{names, ClientError, PeerAnnounce};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::directory::Directory;
use crate::error::Result;
use crate::registration::{PeerInfo, Producer, Registration};

/// Largest acceptable `IDENTIFY` body.
const MAX_IDENTIFY_BODY: u32 = 64 * 1024;

const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

type Reader = BufReader<OwnedReadHalf>;

/// Accept broker connections until shutdown.
///
/// # Errors
/// Fails only if the listener itself breaks; per-connection errors are
/// logged and do not stop the accept loop.
pub async fn serve(dir: Arc<Directory>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "tcp listener started");
    let mut exit = dir.exit_subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    let dir = Arc::clone(&dir);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(dir, stream).await {
                            debug!(client = %remote, %err, "connection ended");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = exit.recv() => break,
        }
    }
    info!(%addr, "tcp listener stopped");
    Ok(())
}

struct Client {
    remote: String,
    producer: Option<Producer>,
}

async fn handle_connection(dir: Arc<Directory>, stream: TcpStream) -> Result<()> {
    let remote = stream.peer_addr()?.to_string();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(16 * 1024, read_half);

    let mut magic = [0u8; 4];
    match timeout(DEFAULT_CLIENT_TIMEOUT, reader.read_exact(&mut magic)).await {
        Ok(Ok(_)) => {}
        _ => return Ok(()),
    }
    let framed = match &magic {
        m if m == MAGIC_V2 => true,
        m if m == MAGIC_V1 => false,
        _ => {
            warn!(client = %remote, ?magic, "bad protocol magic");
            return Ok(());
        }
    };
    info!(client = %remote, version = if framed { "V2" } else { "V1" }, "new client");

    let mut client = Client { remote: remote.clone(), producer: None };
    let result = io_loop(&dir, &mut client, &mut reader, &mut write_half, framed).await;

    info!(client = %remote, "closing");
    teardown(&dir, &client);
    result
}

async fn io_loop(
    dir: &Arc<Directory>,
    client: &mut Client,
    reader: &mut Reader,
    writer: &mut OwnedWriteHalf,
    framed: bool,
) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = match timeout(
            DEFAULT_CLIENT_TIMEOUT,
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

        match exec(dir, client, reader, &params).await {
            Ok(Some(response)) => {
                send(writer, framed, FRAME_TYPE_RESPONSE, &response).await?;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(client = %client.remote, %err, "client error");
                send(writer, framed, FRAME_TYPE_ERROR, err.to_string().as_bytes()).await?;
                if err.is_fatal() {
                    return Ok(());
                }
            }
        }
    }
}

async fn send(
    writer: &mut OwnedWriteHalf,
    framed: bool,
    frame_type: i32,
    data: &[u8],
) -> Result<()> {
    let write = async {
        if framed {
            send_framed_response(writer, frame_type, data).await
        } else {
            send_response(writer, data).await
        }
    };
    match timeout(WRITE_TIMEOUT, write).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        )
        .into()),
    }
}

type ExecResult = std::result::Result<Option<Bytes>, ClientError>;

async fn exec(
    dir: &Arc<Directory>,
    client: &mut Client,
    reader: &mut Reader,
    params: &[&str],
) -> ExecResult {
    match params[0] {
        "PING" => ping(client),
        "IDENTIFY" => identify(dir, client, reader).await,
        "REGISTER" => register(dir, client, params),
        "UNREGISTER" => unregister(dir, client, params),
        other => Err(ClientError::fatal("E_INVALID", format!("invalid command {other}"))),
    }
}

fn ping(client: &Client) -> ExecResult {
    if let Some(producer) = &client.producer {
        // A PING can arrive before any other command on a connection.
        producer.touch();
        debug!(client = %client.remote, producer = %producer.id, "pinged");
    }
    Ok(Some(Bytes::from_static(b"OK")))
}

async fn identify(dir: &Arc<Directory>, client: &mut Client, reader: &mut Reader) -> ExecResult {
    if client.producer.is_some() {
        return Err(ClientError::fatal("E_INVALID", "cannot IDENTIFY again"));
    }

    let body_len = reader.read_u32().await.map_err(|err| {
        ClientError::fatal("E_BAD_BODY", format!("IDENTIFY failed to read body size: {err}"))
    })?;
    if body_len == 0 || body_len > MAX_IDENTIFY_BODY {
        return Err(ClientError::fatal(
            "E_BAD_BODY",
            format!("IDENTIFY invalid body size {body_len}"),
        ));
    }
    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).await.map_err(|err| {
        ClientError::fatal("E_BAD_BODY", format!("IDENTIFY failed to read body: {err}"))
    })?;

    let announce: PeerAnnounce = serde_json::from_slice(&body).map_err(|err| {
        ClientError::fatal("E_BAD_BODY", format!("IDENTIFY failed to decode JSON body: {err}"))
    })?;
    if announce.broadcast_address.is_empty()
        || announce.tcp_port == 0
        || announce.http_port == 0
        || announce.version.is_empty()
    {
        return Err(ClientError::fatal("E_BAD_BODY", "IDENTIFY missing fields"));
    }

    info!(
        client = %client.remote,
        broadcast_address = %announce.broadcast_address,
        tcp_port = announce.tcp_port,
        http_port = announce.http_port,
        version = %announce.version,
        "IDENTIFY"
    );
    let producer: Producer = Arc::new(PeerInfo::new(client.remote.clone(), announce));
    if dir.db.add_producer(Registration::new("client", "", ""), Arc::clone(&producer)) {
        debug!(client = %client.remote, "registered client");
    }
    client.producer = Some(producer);

    let response = serde_json::to_vec(&dir.announce())
        .map_err(|err| ClientError::fatal("E_BAD_BODY", err.to_string()))?;
    Ok(Some(Bytes::from(response)))
}

fn register(dir: &Arc<Directory>, client: &Client, params: &[&str]) -> ExecResult {
    let producer = require_producer(client)?;
    let (topic, channel) = topic_channel_params("REGISTER", params)?;

    if let Some(channel) = channel {
        let reg = Registration::new("channel", topic, channel);
        if dir.db.add_producer(reg, Arc::clone(&producer)) {
            info!(client = %client.remote, topic, channel, "REGISTER channel");
        }
    }
    let reg = Registration::new("topic", topic, "");
    if dir.db.add_producer(reg, producer) {
        info!(client = %client.remote, topic, "REGISTER topic");
    }
    Ok(Some(Bytes::from_static(b"OK")))
}

fn unregister(dir: &Arc<Directory>, client: &Client, params: &[&str]) -> ExecResult {
    let producer = require_producer(client)?;
    let (topic, channel) = topic_channel_params("UNREGISTER", params)?;

    if let Some(channel) = channel {
        let reg = Registration::new("channel", topic, channel);
        let (removed, remaining) = dir.db.remove_producer(&reg, &producer.id);
        if removed {
            info!(client = %client.remote, topic, channel, "UNREGISTER channel");
        }
        // Ephemeral channels vanish with their last producer.
        if remaining == 0 && reg.is_ephemeral_channel() {
            dir.db.remove_registration(&reg);
        }
    } else {
        // Topic-level unregister removes the producer's channel
        // registrations under the topic as well; normally there are none
        // left by this point.
        for reg in dir.db.find_registrations("channel", topic, "*") {
            let (removed, remaining) = dir.db.remove_producer(&reg, &producer.id);
            if removed {
                warn!(
                    client = %client.remote,
                    topic,
                    channel = %reg.sub_key,
                    "unexpected UNREGISTER of channel registration"
                );
                if remaining == 0 && reg.is_ephemeral_channel() {
                    dir.db.remove_registration(&reg);
                }
            }
        }
        let reg = Registration::new("topic", topic, "");
        if dir.db.remove_producer(&reg, &producer.id).0 {
            info!(client = %client.remote, topic, "UNREGISTER topic");
        }
    }
    Ok(Some(Bytes::from_static(b"OK")))
}

fn require_producer(client: &Client) -> std::result::Result<Producer, ClientError> {
    client
        .producer
        .clone()
        .ok_or_else(|| ClientError::fatal("E_INVALID", "client must IDENTIFY"))
}

fn topic_channel_params<'a>(
    command: &str,
    params: &[&'a str],
) -> std::result::Result<(&'a str, Option<&'a str>), ClientError> {
    let topic = *params.get(1).ok_or_else(|| {
        ClientError::fatal("E_INVALID", format!("{command} insufficient number of params"))
    })?;
    let channel = params.get(2).copied().filter(|c| !c.is_empty());

    if !names::is_valid_topic_name(topic) {
        return Err(ClientError::fatal(
            "E_BAD_TOPIC",
            format!("{command} topic name '{topic}' is not valid"),
        ));
    }
    if let Some(channel) = channel {
        if !names::is_valid_channel_name(channel) {
            return Err(ClientError::fatal(
                "E_BAD_CHANNEL",
                format!("{command} channel name '{channel}' is not valid"),
            ));
        }
    }
    Ok((topic, channel))
}

/// Drop every registration the disconnecting producer held, removing
/// emptied ephemeral channel registrations entirely.
fn teardown(dir: &Arc<Directory>, client: &Client) {
    let Some(producer) = &client.producer else {
        return;
    };
    for reg in dir.db.lookup_registrations(&producer.id) {
        let (removed, remaining) = dir.db.remove_producer(&reg, &producer.id);
        if removed {
            debug!(client = %client.remote, registration = %reg, "unregistered on disconnect");
        }
        if remaining == 0 && reg.is_ephemeral_channel() {
            dir.db.remove_registration(&reg);
        }
    }
}
