//! Backend stand-in for ephemeral channels.

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::BackendQueue;
use crate::error::Result;

/// A queue that stores nothing.
///
/// Ephemeral channels never spill to disk; they carry a `NullQueue` so the
/// dequeue path can select over a backend uniformly. `read` never yields.
#[derive(Debug, Default)]
pub struct NullQueue;

impl NullQueue {
    /// Create a new null queue.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendQueue for NullQueue {
    async fn put(&self, _data: Bytes) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Option<Bytes> {
        std::future::pending().await
    }

    fn depth(&self) -> i64 {
        0
    }

    async fn empty(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn discards_everything() {
        let q = NullQueue::new();
        q.put(Bytes::from_static(b"dropped")).await.unwrap();
        assert_eq!(q.depth(), 0);

        // read never yields
        let read = tokio::time::timeout(Duration::from_millis(20), q.read()).await;
        assert!(read.is_err());
    }
}
