//! Segmented on-disk FIFO.
//!
//! Payloads are appended to numbered segment files
//! (`<name>.diskqueue.NNNNNN.dat`) as `u32 BE length || data` records. A
//! metadata file records depth and the read/write positions; it is rewritten
//! atomically (temp file + rename) on sync. A single background task owns
//! all file state: writes and read requests arrive over a command channel,
//! and the read position only advances once a payload has been handed to a
//! live reader.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::backend::BackendQueue;
use crate::error::{Result, StorageError};

/// Largest storable payload. Anything bigger is rejected at `put`.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// How often the background task syncs dirty state even when the
/// write-count threshold has not been reached.
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

enum QueueCommand {
    Put(Bytes, oneshot::Sender<Result<()>>),
    Read(oneshot::Sender<Bytes>),
    Empty(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Disk-backed [`BackendQueue`].
///
/// Survives crashes for synced writes; a reopened queue resumes from the
/// last persisted metadata.
pub struct DiskQueue {
    name: String,
    depth: Arc<AtomicI64>,
    cmd_tx: mpsc::Sender<QueueCommand>,
}

impl DiskQueue {
    /// Open (or create) a disk queue named `name` under `data_dir`.
    ///
    /// `max_bytes_per_file` bounds segment size; `sync_every` is the number
    /// of writes between fsyncs.
    ///
    /// # Errors
    /// Fails if the data directory cannot be created or existing metadata
    /// cannot be read.
    pub async fn new(
        name: impl Into<String>,
        data_dir: impl AsRef<Path>,
        max_bytes_per_file: u64,
        sync_every: u64,
    ) -> Result<Self> {
        let name = name.into();
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;

        let depth = Arc::new(AtomicI64::new(0));
        let mut state = QueueState::new(name.clone(), data_dir, max_bytes_per_file, sync_every);
        state.load_metadata().await?;
        depth.store(state.depth, Ordering::SeqCst);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task_depth = Arc::clone(&depth);
        tokio::spawn(state.run(cmd_rx, task_depth));

        debug!(queue = %name, "disk queue opened");
        Ok(Self { name, depth, cmd_tx })
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> QueueCommand,
    ) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx.send(make(ack_tx)).await.map_err(|_| StorageError::Closed)?;
        ack_rx.await.map_err(|_| StorageError::Closed)?
    }
}

#[async_trait]
impl BackendQueue for DiskQueue {
    async fn put(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Err(StorageError::InvalidPayload("empty payload".into()));
        }
        if data.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(StorageError::InvalidPayload(format!(
                "{} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit",
                data.len()
            )));
        }
        self.command(|ack| QueueCommand::Put(data, ack)).await
    }

    async fn read(&self) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(QueueCommand::Read(tx)).await.ok()?;
        rx.await.ok()
    }

    fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    async fn empty(&self) -> Result<()> {
        self.command(QueueCommand::Empty).await
    }

    async fn close(&self) -> Result<()> {
        debug!(queue = %self.name, "closing disk queue");
        self.command(QueueCommand::Close).await
    }
}

/// All mutable file state, owned by the background task.
struct QueueState {
    name: String,
    data_dir: PathBuf,
    max_bytes_per_file: u64,
    sync_every: u64,

    depth: i64,
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,

    // Position the staged payload ends at; committed once the payload is
    // handed to a reader.
    next_read_file_num: u64,
    next_read_pos: u64,

    read_file: Option<File>,
    write_file: Option<File>,
    writes_since_sync: u64,
    needs_sync: bool,
}

impl QueueState {
    fn new(name: String, data_dir: PathBuf, max_bytes_per_file: u64, sync_every: u64) -> Self {
        Self {
            name,
            data_dir,
            max_bytes_per_file,
            sync_every: sync_every.max(1),
            depth: 0,
            read_file_num: 0,
            read_pos: 0,
            write_file_num: 0,
            write_pos: 0,
            next_read_file_num: 0,
            next_read_pos: 0,
            read_file: None,
            write_file: None,
            writes_since_sync: 0,
            needs_sync: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<QueueCommand>, depth: Arc<AtomicI64>) {
        // A staged payload plus readers parked while the queue was empty.
        // A payload is only consumed when a live reader accepts it, so a
        // cancelled read never loses data.
        let mut staged: Option<Bytes> = None;
        let mut waiters: VecDeque<oneshot::Sender<Bytes>> = VecDeque::new();
        let mut sync_tick = tokio::time::interval(SYNC_TIMEOUT);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if staged.is_none() && self.has_unread() {
                match self.read_one().await {
                    Ok(data) => staged = Some(data),
                    Err(err) => {
                        error!(queue = %self.name, %err, "read failed, skipping to next segment");
                        if let Err(err) = self.skip_bad_segment().await {
                            error!(queue = %self.name, %err, "unable to skip bad segment");
                        }
                        depth.store(self.depth, Ordering::SeqCst);
                        continue;
                    }
                }
            }

            while staged.is_some() && !waiters.is_empty() {
                let waiter = waiters.pop_front().expect("just checked");
                let data = staged.clone().expect("just checked");
                if waiter.send(data).is_ok() {
                    staged = None;
                    self.depth -= 1;
                    depth.store(self.depth, Ordering::SeqCst);
                    if let Err(err) = self.advance_read().await {
                        error!(queue = %self.name, %err, "failed to advance read position");
                    }
                }
            }
            if staged.is_none() && self.has_unread() {
                // More payloads and possibly more waiters; stage the next
                // one before blocking on commands.
                continue;
            }

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(QueueCommand::Put(data, ack)) => {
                        let res = self.write_one(&data).await;
                        if res.is_ok() {
                            self.depth += 1;
                            depth.store(self.depth, Ordering::SeqCst);
                        }
                        let _ = ack.send(res);
                    }
                    Some(QueueCommand::Read(reply)) => {
                        waiters.push_back(reply);
                        // Readers re-issue requests when their select loops
                        // spin; drop the ones that already gave up.
                        waiters.retain(|w| !w.is_closed());
                    }
                    Some(QueueCommand::Empty(ack)) => {
                        staged = None;
                        let res = self.empty_all().await;
                        depth.store(self.depth, Ordering::SeqCst);
                        let _ = ack.send(res);
                    }
                    Some(QueueCommand::Close(ack)) => {
                        let _ = ack.send(self.sync().await);
                        break;
                    }
                    None => {
                        let _ = self.sync().await;
                        break;
                    }
                },

                _ = sync_tick.tick() => {
                    if self.needs_sync {
                        if let Err(err) = self.sync().await {
                            error!(queue = %self.name, %err, "periodic sync failed");
                        }
                    }
                }
            }
        }
        debug!(queue = %self.name, "disk queue task exiting");
    }

    fn has_unread(&self) -> bool {
        self.read_file_num < self.write_file_num || self.read_pos < self.write_pos
    }

    fn segment_path(&self, num: u64) -> PathBuf {
        self.data_dir.join(format!("{}.diskqueue.{:06}.dat", self.name, num))
    }

    fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.diskqueue.meta.dat", self.name))
    }

    async fn write_one(&mut self, data: &[u8]) -> Result<()> {
        if self.write_file.is_none() {
            let path = self.segment_path(self.write_file_num);
            let mut file =
                OpenOptions::new().create(true).write(true).read(true).open(&path).await?;
            if self.write_pos > 0 {
                file.seek(SeekFrom::Start(self.write_pos)).await?;
            }
            self.write_file = Some(file);
        }
        let file = self.write_file.as_mut().expect("write file just opened");
        file.write_u32(data.len() as u32).await?;
        file.write_all(data).await?;
        file.flush().await?;

        self.write_pos += 4 + data.len() as u64;
        self.writes_since_sync += 1;
        self.needs_sync = true;
        if self.writes_since_sync >= self.sync_every {
            self.sync().await?;
        }

        if self.write_pos > self.max_bytes_per_file {
            self.sync().await?;
            self.write_file = None;
            self.write_file_num += 1;
            self.write_pos = 0;
        }
        Ok(())
    }

    async fn read_one(&mut self) -> Result<Bytes> {
        if self.read_file.is_none() {
            let path = self.segment_path(self.read_file_num);
            let mut file = OpenOptions::new().read(true).open(&path).await?;
            if self.read_pos > 0 {
                file.seek(SeekFrom::Start(self.read_pos)).await?;
            }
            self.read_file = Some(file);
        }
        let file = self.read_file.as_mut().expect("read file just opened");
        let len = file.read_u32().await?;
        if len == 0 || len > MAX_PAYLOAD_SIZE {
            return Err(StorageError::InvalidPayload(format!("corrupt record length {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;

        self.next_read_pos = self.read_pos + 4 + u64::from(len);
        self.next_read_file_num = self.read_file_num;
        if self.next_read_pos > self.max_bytes_per_file && self.read_file_num < self.write_file_num
        {
            self.next_read_file_num += 1;
            self.next_read_pos = 0;
        }
        Ok(Bytes::from(buf))
    }

    /// Commit the position of the payload just handed to a reader, deleting
    /// any fully-consumed segment.
    async fn advance_read(&mut self) -> Result<()> {
        let old_num = self.read_file_num;
        self.read_file_num = self.next_read_file_num;
        self.read_pos = self.next_read_pos;
        self.needs_sync = true;
        if self.read_file_num != old_num {
            self.read_file = None;
            remove_if_present(&self.segment_path(old_num)).await;
        }
        Ok(())
    }

    /// On a corrupt record, abandon the remainder of the current read
    /// segment.
    async fn skip_bad_segment(&mut self) -> Result<()> {
        self.read_file = None;
        let bad = self.segment_path(self.read_file_num);
        if self.read_file_num < self.write_file_num {
            remove_if_present(&bad).await;
            self.read_file_num += 1;
            self.read_pos = 0;
        } else {
            // The write segment itself is bad; drop everything in it.
            warn!(queue = %self.name, path = %bad.display(), "abandoning corrupt write segment");
            remove_if_present(&bad).await;
            self.write_file = None;
            self.write_file_num += 1;
            self.write_pos = 0;
            self.read_file_num = self.write_file_num;
            self.read_pos = 0;
        }
        self.depth = 0.max(self.depth - 1);
        self.persist_metadata().await
    }

    async fn empty_all(&mut self) -> Result<()> {
        self.read_file = None;
        self.write_file = None;
        for num in self.read_file_num..=self.write_file_num {
            remove_if_present(&self.segment_path(num)).await;
        }
        self.write_file_num += 1;
        self.write_pos = 0;
        self.read_file_num = self.write_file_num;
        self.read_pos = 0;
        self.next_read_file_num = self.read_file_num;
        self.next_read_pos = 0;
        self.depth = 0;
        self.writes_since_sync = 0;
        self.persist_metadata().await
    }

    async fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.write_file.as_mut() {
            file.sync_data().await?;
        }
        self.writes_since_sync = 0;
        self.needs_sync = false;
        self.persist_metadata().await
    }

    async fn persist_metadata(&self) -> Result<()> {
        let tmp = self.metadata_path().with_extension("tmp");
        let contents = format!(
            "{}\n{},{}\n{},{}\n",
            self.depth, self.read_file_num, self.read_pos, self.write_file_num, self.write_pos
        );
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, self.metadata_path()).await?;
        Ok(())
    }

    async fn load_metadata(&mut self) -> Result<()> {
        let raw = match tokio::fs::read_to_string(self.metadata_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut lines = raw.lines();
        let depth = lines.next().and_then(|l| l.trim().parse::<i64>().ok());
        let read = lines.next().and_then(parse_pair);
        let write = lines.next().and_then(parse_pair);
        match (depth, read, write) {
            (Some(depth), Some((rf, rp)), Some((wf, wp))) => {
                self.depth = depth;
                self.read_file_num = rf;
                self.read_pos = rp;
                self.next_read_file_num = rf;
                self.next_read_pos = rp;
                self.write_file_num = wf;
                self.write_pos = wp;
                Ok(())
            }
            _ => {
                warn!(queue = %self.name, "ignoring malformed metadata file");
                Ok(())
            }
        }
    }
}

fn parse_pair(line: &str) -> Option<(u64, u64)> {
    let (a, b) = line.trim().split_once(',')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove segment file"),
    }
}
