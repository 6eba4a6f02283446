//! Progressive byte store backed by a filesystem file.
//!
//! A [`ProgressiveByteStore`] is a growing file that the ingestion side appends to while a
//! decoder reads it from another thread. Access goes through two exclusive handles:
//! - [`StoreWriter`]: at most one per store, obtained with [`ProgressiveByteStore::take_writer`].
//! - [`StoreReader`]: at most one open at a time, obtained with [`ProgressiveByteStore::open`].
//!
//! Design notes:
//! - Reads never block. With nothing new to read, [`StoreReader::read`] returns
//!   `{ bytes_read: 0, end_of_stream: false }` until the store is completed, and
//!   `{ bytes_read: 0, end_of_stream: true }` afterwards.
//! - The writer and the reader use separate `File` handles (not `try_clone()`, which would share
//!   the cursor) so a reader can seek backward while the writer keeps appending.
//! - Writes are unbuffered: once `append` returns, the bytes are visible to the reader.
//! - `write_pos` is published with `Release` after the write; completion is published after the
//!   last `write_pos` store. A reader loads completion first, then `write_pos` (both `Acquire`),
//!   so observing completion implies observing every appended byte.
//! - The backing file is transient. It is removed when the last handle to the store is dropped.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{TtsError, TtsResult};
use crate::key::RequestKey;

const OPEN: u8 = 0;

/// Why a store stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Completion {
    /// The stream delivered its final chunk (or was replaced by a precomputed resource).
    Finished = 1,
    /// The stream ended on a transport failure or a terminal server error.
    Failed = 2,
    /// The request was cancelled by the caller.
    Cancelled = 3,
}

impl Completion {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Completion::Finished),
            2 => Some(Completion::Failed),
            3 => Some(Completion::Cancelled),
            _ => None,
        }
    }
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes_read: usize,
    pub end_of_stream: bool,
}

impl ReadOutcome {
    const PENDING: ReadOutcome = ReadOutcome {
        bytes_read: 0,
        end_of_stream: false,
    };
    const EOS: ReadOutcome = ReadOutcome {
        bytes_read: 0,
        end_of_stream: true,
    };

    /// No bytes now, but more may arrive.
    pub fn is_pending(&self) -> bool {
        self.bytes_read == 0 && !self.end_of_stream
    }
}

/// Byte region of a single append, carried by chunk events instead of a copy of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRegion {
    pub offset: u64,
    pub len: u64,
}

impl ChunkRegion {
    /// The region as a byte range of the store.
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

struct Shared {
    key: RequestKey,
    path: PathBuf,
    // Guards the writer file against a concurrent `close()`. Held only around a single write.
    file: Mutex<Option<File>>,
    write_pos: AtomicU64,
    completion: AtomicU8,
    writer_taken: AtomicBool,
    reader_open: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn completion(&self) -> Option<Completion> {
        Completion::from_u8(self.completion.load(Ordering::Acquire))
    }

    fn complete_locked(&self, how: Completion) -> bool {
        let done = self
            .completion
            .compare_exchange(OPEN, how as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if done {
            debug!(
                key = %self.key,
                bytes = self.write_pos.load(Ordering::Acquire),
                completion = ?how,
                "progressive store completed"
            );
        }
        done
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: the transient file has no further readers.
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!("store: removed transient file path='{}'", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "store: failed to remove transient file path='{}': {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Growing, file-backed byte buffer for one request key.
///
/// Cheap to clone; all clones refer to the same store.
#[derive(Clone)]
pub struct ProgressiveByteStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for ProgressiveByteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressiveByteStore")
            .field("key", &self.shared.key)
            .field("path", &self.shared.path)
            .field("write_position", &self.write_position())
            .field("completion", &self.completion())
            .finish()
    }
}

impl ProgressiveByteStore {
    /// Create (or truncate) the backing file at `path` and return an empty store.
    pub fn create(key: RequestKey, path: impl AsRef<Path>) -> TtsResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TtsError::from(e).with_context("creating store parent directory"))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TtsError::from(e).with_context("opening store file"))?;

        trace!("store: created key='{}' path='{}'", key, path.display());

        Ok(Self {
            shared: Arc::new(Shared {
                key,
                path,
                file: Mutex::new(Some(file)),
                write_pos: AtomicU64::new(0),
                completion: AtomicU8::new(OPEN),
                writer_taken: AtomicBool::new(false),
                reader_open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn key(&self) -> &RequestKey {
        &self.shared.key
    }

    /// Path of the transient backing file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Number of bytes appended so far.
    pub fn write_position(&self) -> u64 {
        self.shared.write_pos.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.shared.completion().is_some()
    }

    /// Why the store completed, or `None` while it is still growing.
    pub fn completion(&self) -> Option<Completion> {
        self.shared.completion()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Claim the single writer handle. Returns `None` if it was already taken.
    pub fn take_writer(&self) -> Option<StoreWriter> {
        self.shared
            .writer_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StoreWriter {
                shared: Arc::clone(&self.shared),
            })
    }

    /// Open the single reader at position 0.
    pub fn open(&self) -> TtsResult<StoreReader> {
        self.open_at(0)
    }

    /// Open the single reader at `offset`, which must not exceed the current write position.
    pub fn open_at(&self, offset: u64) -> TtsResult<StoreReader> {
        let key = || self.shared.key.to_string();

        if self.is_closed() {
            return Err(TtsError::StoreClosed { key: key() });
        }
        if offset > self.write_position() {
            return Err(TtsError::InvalidParams("reader offset beyond write position"));
        }
        if self
            .shared
            .reader_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TtsError::ReaderAlreadyOpen { key: key() });
        }

        let file = match File::open(&self.shared.path) {
            Ok(f) => f,
            Err(e) => {
                self.shared.reader_open.store(false, Ordering::Release);
                return Err(TtsError::from(e).with_context("opening store reader"));
            }
        };

        trace!("store: reader opened key='{}' offset={}", self.shared.key, offset);

        Ok(StoreReader {
            shared: Arc::clone(&self.shared),
            file,
            pos: offset,
        })
    }

    /// Complete the store without a writer handle (e.g. cancellation before the first chunk).
    ///
    /// Returns true if this call completed the store.
    pub fn complete_with(&self, how: Completion) -> bool {
        let _guard = self.shared.file.lock();
        self.shared.complete_locked(how)
    }

    /// Release the backing file handle. Idempotent.
    ///
    /// An open store is completed as [`Completion::Cancelled`] first so a reader never waits on
    /// a store that can no longer grow. Subsequent reads fail.
    pub fn close(&self) {
        let mut guard = self.shared.file.lock();
        self.shared.complete_locked(Completion::Cancelled);
        if guard.take().is_some() {
            self.shared.closed.store(true, Ordering::Release);
            debug!(key = %self.shared.key, "progressive store closed");
        }
    }
}

/// Exclusive append handle of a [`ProgressiveByteStore`].
///
/// Dropping a writer that never completed the store completes it as [`Completion::Failed`],
/// so a reader always reaches end-of-stream.
pub struct StoreWriter {
    shared: Arc<Shared>,
}

impl fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWriter")
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl StoreWriter {
    pub fn key(&self) -> &RequestKey {
        &self.shared.key
    }

    /// Append `bytes` at the end of the store and return the region they occupy.
    pub fn append(&mut self, bytes: &[u8]) -> TtsResult<ChunkRegion> {
        let mut guard = self.shared.file.lock();

        if self.shared.completion().is_some() {
            return Err(TtsError::AppendAfterComplete {
                key: self.shared.key.to_string(),
            });
        }
        let file = guard.as_mut().ok_or_else(|| TtsError::StoreClosed {
            key: self.shared.key.to_string(),
        })?;

        let offset = self.shared.write_pos.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;

        let len = bytes.len() as u64;
        self.shared.write_pos.store(offset + len, Ordering::Release);
        trace!(
            "store: append key='{}' offset={} len={}",
            self.shared.key,
            offset,
            len
        );

        Ok(ChunkRegion { offset, len })
    }

    /// Mark the store as successfully finished. Idempotent.
    pub fn mark_complete(&mut self) -> bool {
        self.complete_with(Completion::Finished)
    }

    /// Complete the store with an explicit reason. The first completion wins.
    pub fn complete_with(&mut self, how: Completion) -> bool {
        let _guard = self.shared.file.lock();
        self.shared.complete_locked(how)
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        let _guard = self.shared.file.lock();
        self.shared.complete_locked(Completion::Failed);
    }
}

/// Exclusive, non-blocking read handle of a [`ProgressiveByteStore`].
///
/// Also implements [`Read`] and [`Seek`] for decoders: "no bytes yet" maps to
/// [`io::ErrorKind::WouldBlock`], end-of-stream to `Ok(0)`.
pub struct StoreReader {
    shared: Arc<Shared>,
    file: File,
    pos: u64,
}

impl fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreReader")
            .field("key", &self.shared.key)
            .field("position", &self.pos)
            .finish()
    }
}

impl StoreReader {
    pub fn key(&self) -> &RequestKey {
        &self.shared.key
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// True once the store stopped growing.
    pub fn is_complete(&self) -> bool {
        self.shared.completion().is_some()
    }

    pub fn write_position(&self) -> u64 {
        self.shared.write_pos.load(Ordering::Acquire)
    }

    /// Bytes written but not yet read.
    pub fn available(&self) -> u64 {
        self.shared
            .write_pos
            .load(Ordering::Acquire)
            .saturating_sub(self.pos)
    }

    /// Read up to `buf.len()` bytes that are already available. Never blocks.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "store closed"));
        }

        // Completion before position: see module notes.
        let complete = self.shared.completion().is_some();
        let end = self.shared.write_pos.load(Ordering::Acquire);
        let available = end.saturating_sub(self.pos);

        if available == 0 {
            return Ok(if complete {
                ReadOutcome::EOS
            } else {
                ReadOutcome::PENDING
            });
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::PENDING);
        }

        let want = available.min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(self.pos))?;

        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.pos += filled as u64;

        Ok(ReadOutcome {
            bytes_read: filled,
            end_of_stream: false,
        })
    }

    /// Move the cursor to `pos`, which must not exceed the write position.
    pub fn seek_to(&mut self, pos: u64) -> io::Result<u64> {
        let end = self.shared.write_pos.load(Ordering::Acquire);
        if pos > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek beyond written data",
            ));
        }
        self.pos = pos;
        Ok(pos)
    }
}

impl Read for StoreReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let out = StoreReader::read(self, buf)?;
        if out.is_pending() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no bytes available yet",
            ));
        }
        Ok(out.bytes_read)
    }
}

impl Seek for StoreReader {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let target = match position {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => {
                if self.shared.completion().is_none() {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "seek from end of a growing store",
                    ));
                }
                self.shared
                    .write_pos
                    .load(Ordering::Acquire)
                    .checked_add_signed(d)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek to a negative position")
        })?;
        self.seek_to(target)
    }
}

impl Drop for StoreReader {
    fn drop(&mut self) {
        self.shared.reader_open.store(false, Ordering::Release);
        trace!("store: reader closed key='{}' pos={}", self.shared.key, self.pos);
    }
}
