//! The abstract backend queue contract.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A durable FIFO of opaque byte payloads.
///
/// Topics and channels spill to a backend queue when their in-memory queue
/// saturates, and drain it through [`read`](BackendQueue::read). Payloads
/// acknowledged by [`put`](BackendQueue::put) must survive process crashes
/// for durable implementations.
#[async_trait]
pub trait BackendQueue: Send + Sync {
    /// Append one payload.
    ///
    /// # Errors
    /// Fails if the payload is unstorable or the write cannot be completed.
    async fn put(&self, data: Bytes) -> Result<()>;

    /// Wait for the next payload, in FIFO order across `put` calls from a
    /// single producer.
    ///
    /// Returns `None` once the queue is closed and drained. Cancel-safe: a
    /// dropped `read` future never loses a payload.
    async fn read(&self) -> Option<Bytes>;

    /// Number of undelivered payloads.
    fn depth(&self) -> i64;

    /// Discard every payload and any underlying storage.
    ///
    /// # Errors
    /// Fails if the queue is closed or storage removal fails.
    async fn empty(&self) -> Result<()>;

    /// Flush and stop the queue, retaining stored payloads.
    ///
    /// # Errors
    /// Fails if the final flush cannot be completed.
    async fn close(&self) -> Result<()>;
}
