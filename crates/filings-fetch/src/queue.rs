//! Disk-backed work queue
//!
//! [`IoQueue`] is a FIFO channel between one producer and many workers that
//! bounds resident memory independently of queue length: puts accumulate in
//! an in-memory push buffer and spill to an append-only log one batch at a
//! time, gets are served from an in-memory pop buffer refilled batch by
//! batch. [`SharedQueue`] adds the single lock that serializes every
//! operation across tasks.
//!
//! Framing: each flushed batch is one compact JSON array followed by a
//! newline. serde_json's compact encoding never emits a raw newline, so the
//! delimiter cannot appear inside a payload. Readers scan forward in fixed
//! chunks for the delimiter instead of loading the file wholesale, keeping
//! peak memory to one batch.
//!
//! Recovery: a cursor sidecar records the log offset below which every item
//! was delivered, updated whenever a disk-loaded batch is fully consumed.
//! [`IoQueue::resume`] re-delivers at batch granularity, so delivery across a
//! crash is at-least-once; the sink's idempotency gate absorbs duplicates.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use filings_common::types::QueueMessage;

/// Items per flushed batch unless overridden.
pub const DEFAULT_BATCH_SIZE: usize = 128;

const FRAME_DELIMITER: u8 = b'\n';
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Nothing is pending. Callers back off and retry (or, once end-of-stream
    /// markers are in flight, treat it as transient).
    #[error("queue is empty")]
    Empty,

    #[error("queue log IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt queue batch: {0}")]
    Codec(#[from] serde_json::Error),

    /// Data exists past the read offset but no frame delimiter follows it.
    #[error("queue log truncated mid-batch at offset {0}")]
    TruncatedBatch(u64),
}

/// Where the next pop buffer comes from.
///
/// `DiskLog` whenever flushed-but-unloaded batches exist; otherwise the
/// pending items (if any) all still live in the push buffer and can be moved
/// over without touching disk. Disk batches are always older than anything in
/// the push buffer, so this ordering preserves FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefillSource {
    DiskLog,
    PushBuffer,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct QueueCursor {
    /// Every item encoded before this log offset has been delivered.
    offset: u64,
}

/// Bounded-memory FIFO with disk spillover.
///
/// Performs no internal locking; all calls must be serialized externally
/// (see [`SharedQueue`]). Unsynchronized concurrent use corrupts the read
/// offset and counters.
pub struct IoQueue<T> {
    log_path: PathBuf,
    cursor_path: PathBuf,
    batch_size: usize,
    push_buffer: Vec<T>,
    pop_buffer: VecDeque<T>,
    /// Current pop buffer was decoded from the log (as opposed to moved from
    /// the push buffer), so exhausting it advances the durable cursor.
    pop_from_disk: bool,
    pushed: u64,
    popped: u64,
    /// Items appended to the log so far.
    flushed: u64,
    /// Log items decoded into pop buffers so far.
    loaded: u64,
    /// Read offset of the next unloaded batch.
    seek_to: u64,
}

impl<T> IoQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a fresh queue, truncating any previous log at `path`.
    pub fn create(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self, QueueError> {
        let log_path = path.into();
        let cursor_path = cursor_path_for(&log_path);
        // Truncate leftovers from a previous run.
        File::create(&log_path)?;
        if cursor_path.exists() {
            std::fs::remove_file(&cursor_path)?;
        }
        Ok(Self::empty(log_path, cursor_path, batch_size))
    }

    /// Reopen the queue of an interrupted run.
    ///
    /// Pushed/flushed counters are rebuilt by scanning the log; the popped
    /// counter and read offset are restored from the cursor sidecar. Items of
    /// a batch that was only partially consumed before the crash are
    /// re-delivered.
    pub fn resume(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self, QueueError> {
        let log_path = path.into();
        let cursor_path = cursor_path_for(&log_path);

        let cursor = match std::fs::read(&cursor_path) {
            Ok(bytes) => serde_json::from_slice::<QueueCursor>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueCursor::default(),
            Err(e) => return Err(e.into()),
        };

        let mut total: u64 = 0;
        let mut delivered: u64 = 0;
        let mut offset: u64 = 0;
        if log_path.exists() {
            let mut reader = BufReader::new(File::open(&log_path)?);
            let mut line = Vec::new();
            loop {
                line.clear();
                // A torn final write (bytes with no delimiter) is dropped; it
                // was never part of a completed batch append.
                let Some(n) = read_until_delimiter(&mut reader, &mut line)? else {
                    break;
                };
                let batch: Vec<serde_json::Value> = serde_json::from_slice(&line)?;
                if offset < cursor.offset {
                    delivered += batch.len() as u64;
                }
                total += batch.len() as u64;
                offset += n as u64;
            }
        } else {
            File::create(&log_path)?;
        }

        let mut queue = Self::empty(log_path, cursor_path, batch_size);
        queue.pushed = total;
        queue.flushed = total;
        queue.popped = delivered;
        queue.loaded = delivered;
        queue.seek_to = cursor.offset;
        Ok(queue)
    }

    fn empty(log_path: PathBuf, cursor_path: PathBuf, batch_size: usize) -> Self {
        Self {
            log_path,
            cursor_path,
            batch_size,
            push_buffer: Vec::new(),
            pop_buffer: VecDeque::new(),
            pop_from_disk: false,
            pushed: 0,
            popped: 0,
            flushed: 0,
            loaded: 0,
            seek_to: 0,
        }
    }

    /// Append one item. Amortized O(1): the push buffer spills to the log
    /// only when it already holds a full batch.
    pub fn put(&mut self, item: T) -> Result<(), QueueError> {
        if self.push_buffer.len() >= self.batch_size {
            self.flush_push_buffer()?;
        }
        debug_assert!(self.push_buffer.len() < self.batch_size);
        self.push_buffer.push(item);
        self.pushed += 1;
        Ok(())
    }

    /// Take the next item in global FIFO order.
    pub fn get(&mut self) -> Result<T, QueueError> {
        if self.pop_buffer.is_empty() {
            self.refill()?;
        }
        let item = self.pop_buffer.pop_front().ok_or(QueueError::Empty)?;
        self.popped += 1;
        if self.pop_buffer.is_empty() && self.pop_from_disk {
            // The whole disk batch has now been handed out.
            self.persist_cursor()?;
        }
        Ok(item)
    }

    /// Logical queue length.
    pub fn size(&self) -> u64 {
        self.pushed - self.popped
    }

    /// `(popped, pushed)` counters for progress reporting.
    pub fn get_statistics(&self) -> (u64, u64) {
        (self.popped, self.pushed)
    }

    /// Force any buffered items to the log, regardless of batch fill.
    ///
    /// Called by the producer once the end-of-stream markers are enqueued so
    /// the tail of the stream survives a crash.
    pub fn flush(&mut self) -> Result<(), QueueError> {
        if self.push_buffer.is_empty() {
            return Ok(());
        }
        self.flush_push_buffer()
    }

    fn flush_push_buffer(&mut self) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(&self.push_buffer)?;
        debug_assert!(
            !encoded.contains(&FRAME_DELIMITER),
            "frame delimiter inside encoded batch"
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(&encoded)?;
        file.write_all(&[FRAME_DELIMITER])?;
        self.flushed += self.push_buffer.len() as u64;
        self.push_buffer.clear();
        Ok(())
    }

    fn disk_pending(&self) -> u64 {
        self.flushed - self.loaded
    }

    fn refill(&mut self) -> Result<(), QueueError> {
        let source = if self.disk_pending() > 0 {
            RefillSource::DiskLog
        } else if !self.push_buffer.is_empty() {
            RefillSource::PushBuffer
        } else {
            return Err(QueueError::Empty);
        };

        match source {
            RefillSource::DiskLog => self.refill_from_disk(),
            RefillSource::PushBuffer => {
                self.pop_buffer = std::mem::take(&mut self.push_buffer).into();
                self.pop_from_disk = false;
                Ok(())
            },
        }
    }

    /// Decode the next batch starting at the persisted offset, scanning for
    /// the delimiter in fixed-size chunks.
    fn refill_from_disk(&mut self) -> Result<(), QueueError> {
        let mut file = File::open(&self.log_path)?;
        file.seek(SeekFrom::Start(self.seek_to))?;

        let mut line: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                return Err(QueueError::TruncatedBatch(self.seek_to));
            }
            if let Some(pos) = chunk[..n].iter().position(|&b| b == FRAME_DELIMITER) {
                line.extend_from_slice(&chunk[..pos]);
                break;
            }
            line.extend_from_slice(&chunk[..n]);
        }

        let batch: Vec<T> = serde_json::from_slice(&line)?;
        self.seek_to += line.len() as u64 + 1;
        self.loaded += batch.len() as u64;
        self.pop_buffer = batch.into();
        self.pop_from_disk = true;
        Ok(())
    }

    fn persist_cursor(&self) -> Result<(), QueueError> {
        let cursor = QueueCursor {
            offset: self.seek_to,
        };
        let tmp_path = self.cursor_path.with_extension("cursor.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec(&cursor)?)?;
        std::fs::rename(&tmp_path, &self.cursor_path)?;
        Ok(())
    }
}

fn cursor_path_for(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(".cursor");
    PathBuf::from(name)
}

/// Read one delimiter-terminated frame into `buf`, returning the number of
/// bytes consumed including the delimiter, or `None` at end of file.
fn read_until_delimiter(
    reader: &mut impl Read,
    buf: &mut Vec<u8>,
) -> Result<Option<usize>, QueueError> {
    let mut total = 0usize;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Ok(None);
        }
        total += 1;
        if byte[0] == FRAME_DELIMITER {
            return Ok(Some(total));
        }
        buf.push(byte[0]);
    }
}

/// The queue plus its lock: one mutual-exclusion lock shared by the producer
/// and every worker, held only for the duration of an individual queue
/// operation and always released before network, transform, or storage work.
///
/// Queue operations do synchronous file IO on the runtime thread while the
/// lock is held. Each acquisition covers at most one encoded batch append or
/// one chunked batch read, so the stall is bounded by the batch size, not the
/// queue length.
#[derive(Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<IoQueue<QueueMessage>>>,
}

impl SharedQueue {
    pub fn new(queue: IoQueue<QueueMessage>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    pub async fn put(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.inner.lock().await.put(message)
    }

    /// One size-check-then-dequeue under a single lock acquisition.
    ///
    /// `Ok(None)` means "observed empty, back off and retry"; real failures
    /// still surface as errors.
    pub async fn try_get(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut queue = self.inner.lock().await;
        if queue.size() == 0 {
            return Ok(None);
        }
        match queue.get() {
            Ok(message) => Ok(Some(message)),
            Err(QueueError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn flush(&self) -> Result<(), QueueError> {
        self.inner.lock().await.flush()
    }

    pub async fn size(&self) -> u64 {
        self.inner.lock().await.size()
    }

    pub async fn statistics(&self) -> (u64, u64) {
        self.inner.lock().await.get_statistics()
    }
}
