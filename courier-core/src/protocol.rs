//! Length-prefixed frame protocol.
//!
//! Every response is `u32 BE size || data`. Framed (V2) responses embed a
//! `u32 BE frame type` at the front of `data`; the size therefore covers
//! `len(payload) + 4`. Legacy (V1) responses omit the frame type word.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, Result};

/// Magic written by legacy text-response clients on connect.
pub const MAGIC_V1: &[u8; 4] = b"  V1";

/// Magic written by framed-response clients on connect.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Frame type of a successful response.
pub const FRAME_TYPE_RESPONSE: i32 = 0;

/// Frame type of an error response.
pub const FRAME_TYPE_ERROR: i32 = 1;

/// Frame type of a serialized message.
pub const FRAME_TYPE_MESSAGE: i32 = 2;

/// Out-of-band liveness payload, never matched to a request.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Upper bound on a single response body; larger frames are a protocol
/// violation.
pub const MAX_RESPONSE_SIZE: u32 = 16 * 1024 * 1024;

/// The amount of idle time allowed on a connection before a read fails.
pub const DEFAULT_CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Write a framed response: `size || frame_type || data`.
///
/// # Errors
/// Propagates I/O failures from the underlying writer.
pub async fn send_framed_response<W>(w: &mut W, frame_type: i32, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let size = data.len() as u32 + 4;
    w.write_u32(size).await?;
    w.write_i32(frame_type).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

/// Write an unframed (V1) response: `size || data`.
///
/// # Errors
/// Propagates I/O failures from the underlying writer.
pub async fn send_response<W>(w: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u32(data.len() as u32).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed response body (frame type included, if any).
///
/// # Errors
/// Fails on I/O errors and on frames exceeding [`MAX_RESPONSE_SIZE`].
pub async fn read_response<R>(r: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let size = r.read_u32().await?;
    if size > MAX_RESPONSE_SIZE {
        return Err(CoreError::Protocol(format!("response of {size} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; size as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Split a framed response body into `(frame_type, payload)`.
///
/// # Errors
/// Fails if the body is too short to carry a frame type.
pub fn unpack_response(mut buf: Bytes) -> Result<(i32, Bytes)> {
    if buf.len() < 4 {
        return Err(CoreError::Protocol("response too small to unpack".into()));
    }
    let frame_type = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let payload = buf.split_off(4);
    Ok((frame_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_round_trip() {
        let mut wire = Vec::new();
        send_framed_response(&mut wire, FRAME_TYPE_RESPONSE, b"OK").await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let body = read_response(&mut cursor).await.unwrap();
        let (frame_type, payload) = unpack_response(body).unwrap();
        assert_eq!(frame_type, FRAME_TYPE_RESPONSE);
        assert_eq!(&payload[..], b"OK");
    }

    #[tokio::test]
    async fn unframed_round_trip() {
        let mut wire = Vec::new();
        send_response(&mut wire, b"OK").await.unwrap();
        assert_eq!(wire, [0, 0, 0, 2, b'O', b'K']);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_RESPONSE_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_response(&mut cursor).await.is_err());
    }

    #[test]
    fn unpack_rejects_short_body() {
        assert!(unpack_response(Bytes::from_static(b"xy")).is_err());
    }
}
