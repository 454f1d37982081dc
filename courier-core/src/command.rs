//! Commands sent from a broker to a directory.
//!
//! A command is a newline-terminated ASCII line of space-separated tokens,
//! optionally followed by a 4-byte big-endian length and a body (only
//! `IDENTIFY` carries one).

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// The identity a broker announces to a directory, and the identity a
/// directory returns about itself. JSON-encoded as the `IDENTIFY` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnounce {
    /// TCP port the peer serves its protocol on.
    pub tcp_port: u16,
    /// HTTP port the peer serves queries/stats on.
    pub http_port: u16,
    /// Peer software version.
    pub version: String,
    /// Address consumers should use to reach the peer.
    pub broadcast_address: String,
    /// Peer hostname.
    pub hostname: String,
}

/// A single directory-bound request.
#[derive(Debug, Clone)]
pub struct Command {
    name: &'static str,
    params: Vec<String>,
    body: Option<Bytes>,
}

impl Command {
    /// `IDENTIFY` with a JSON identity body.
    ///
    /// # Errors
    /// Fails if the identity cannot be serialized.
    pub fn identify(announce: &PeerAnnounce) -> Result<Self> {
        let body = serde_json::to_vec(announce)?;
        Ok(Self { name: "IDENTIFY", params: Vec::new(), body: Some(Bytes::from(body)) })
    }

    /// `REGISTER topic [channel]`.
    pub fn register(topic: &str, channel: Option<&str>) -> Self {
        Self { name: "REGISTER", params: topic_channel_params(topic, channel), body: None }
    }

    /// `UNREGISTER topic [channel]`.
    pub fn unregister(topic: &str, channel: Option<&str>) -> Self {
        Self { name: "UNREGISTER", params: topic_channel_params(topic, channel), body: None }
    }

    /// `PING` heartbeat.
    pub fn ping() -> Self {
        Self { name: "PING", params: Vec::new(), body: None }
    }

    /// Serialize onto the wire.
    ///
    /// # Errors
    /// Propagates I/O failures from the underlying writer.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = String::from(self.name);
        for param in &self.params {
            line.push(' ');
            line.push_str(param);
        }
        line.push('\n');
        w.write_all(line.as_bytes()).await?;
        if let Some(body) = &self.body {
            w.write_u32(body.len() as u32).await?;
            w.write_all(body).await?;
        }
        w.flush().await?;
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        Ok(())
    }
}

fn topic_channel_params(topic: &str, channel: Option<&str>) -> Vec<String> {
    let mut params = vec![topic.to_owned()];
    if let Some(channel) = channel {
        params.push(channel.to_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_line() {
        let mut wire = Vec::new();
        Command::register("orders", Some("workers")).write_to(&mut wire).await.unwrap();
        assert_eq!(wire, b"REGISTER orders workers\n");
    }

    #[tokio::test]
    async fn ping_line() {
        let mut wire = Vec::new();
        Command::ping().write_to(&mut wire).await.unwrap();
        assert_eq!(wire, b"PING\n");
    }

    #[tokio::test]
    async fn identify_carries_length_prefixed_body() {
        let announce = PeerAnnounce {
            tcp_port: 4150,
            http_port: 4151,
            version: "0.4.0".into(),
            broadcast_address: "10.0.0.5".into(),
            hostname: "worker-1".into(),
        };
        let mut wire = Vec::new();
        Command::identify(&announce).unwrap().write_to(&mut wire).await.unwrap();

        assert!(wire.starts_with(b"IDENTIFY\n"));
        let rest = &wire[b"IDENTIFY\n".len()..];
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        assert_eq!(len, rest.len() - 4);
        let parsed: PeerAnnounce = serde_json::from_slice(&rest[4..]).unwrap();
        assert_eq!(parsed.broadcast_address, "10.0.0.5");
    }

    #[test]
    fn display_omits_body() {
        let cmd = Command::unregister("orders", None);
        assert_eq!(cmd.to_string(), "UNREGISTER orders");
    }
}
