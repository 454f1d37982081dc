//! Message type and binary wire codec.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Length of a message identifier in bytes.
pub const MSG_ID_LENGTH: usize = 16;

/// Minimum encoded size of a message: timestamp + attempts + id.
pub const MSG_MIN_SIZE: usize = 8 + 2 + MSG_ID_LENGTH;

/// Opaque 16-byte message identifier.
///
/// Identifiers are unique only within a channel's in-flight and deferred
/// sets; they are assigned by the publishing broker and rendered as 32
/// lowercase hex characters on the text protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MSG_ID_LENGTH]);

impl MessageId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Wrap raw identifier bytes.
    pub const fn from_bytes(bytes: [u8; MSG_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The raw identifier bytes.
    pub const fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }

    /// Parse the 32-character hex form used on the text protocol.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::try_parse(s)
            .map_err(|_| CoreError::InvalidMessage(format!("bad message id '{s}'")))?;
        Ok(Self(*uuid.as_bytes()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).as_simple())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A single published message.
///
/// Each channel receives its own copy on fan-out; the attempt counter is
/// mutated per channel and increments on every delivery.
#[derive(Debug, Clone)]
pub struct Message {
    /// Opaque identifier, unique within a channel's tracked sets.
    pub id: MessageId,
    /// Creation time in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Delivery attempt counter, incremented per delivery.
    pub attempts: u16,
    /// Message payload.
    pub body: Bytes,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self { id, timestamp: unix_nanos(), attempts: 0, body }
    }

    /// Copy for fan-out into a channel: same identity, body, and creation
    /// time, fresh attempt counter.
    pub fn fanout_copy(&self) -> Self {
        Self { id: self.id, timestamp: self.timestamp, attempts: 0, body: self.body.clone() }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        MSG_MIN_SIZE + self.body.len()
    }

    /// Encode to the wire layout:
    ///
    /// ```text
    /// 8B BE timestamp (ns) || 2B BE attempts || 16B id || body
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode from the wire layout.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidMessage`] if the buffer is shorter than
    /// the fixed header.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < MSG_MIN_SIZE {
            return Err(CoreError::InvalidMessage(format!(
                "{} bytes is too small for a message",
                data.len()
            )));
        }
        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0u8; MSG_ID_LENGTH];
        data.copy_to_slice(&mut id);
        Ok(Self { id: MessageId::from_bytes(id), timestamp, attempts, body: data })
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = Message::new(MessageId::random(), Bytes::from_static(b"payload"));
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.timestamp, msg.timestamp);
        assert_eq!(decoded.attempts, 0);
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(Message::decode(Bytes::from_static(b"too short")).is_err());
    }

    #[test]
    fn empty_body_is_valid() {
        let msg = Message::new(MessageId::random(), Bytes::new());
        let decoded = Message::decode(msg.encode()).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn id_hex_round_trip() {
        let id = MessageId::random();
        let parsed = MessageId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn fanout_copy_resets_attempts() {
        let mut msg = Message::new(MessageId::random(), Bytes::from_static(b"x"));
        msg.attempts = 7;
        let copy = msg.fanout_copy();
        assert_eq!(copy.attempts, 0);
        assert_eq!(copy.id, msg.id);
        assert_eq!(copy.timestamp, msg.timestamp);
    }
}
