//! Persistent cache of finished audio artifacts.
//!
//! Layout:
//! - final artifacts: `<cache_dir>/<key>.<ext>` (one file per request key),
//! - transient files: `<temp_dir>/<key>.<n>.part` (progressive stores, `n` unique per store) and
//!   `<temp_dir>/<key>.<ext>.download` (cache writes in progress).
//!
//! `cache_dir` and `temp_dir` must be distinct: everything under `temp_dir` may be swept at any
//! time the pipeline is idle, while `cache_dir` only ever contains complete artifacts. A cache file
//! becomes visible through an atomic rename once fully written and synced.
//!
//! Eviction is optional and LRU by file mtime (a cache hit touches the file), bounded by
//! `max_entries`.

use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::{debug, trace, warn};

use crate::error::{TtsError, TtsResult};
use crate::format::AudioFormat;
use crate::key::RequestKey;

/// A complete audio artifact in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub path: PathBuf,
    pub format: AudioFormat,
}

/// Filesystem cache for final audio artifacts, plus the transient directory next to it.
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    temp_dir: PathBuf,
    preferred_format: AudioFormat,
    max_entries: Option<NonZeroUsize>,
    progressive_seq: Arc<AtomicU64>,
}

impl CacheStore {
    /// Create the cache rooted at `cache_dir` with transient files under `temp_dir`.
    ///
    /// Both directories are created if missing.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        preferred_format: AudioFormat,
    ) -> TtsResult<Self> {
        let cache_dir = cache_dir.into();
        let temp_dir = temp_dir.into();
        if cache_dir == temp_dir {
            return Err(TtsError::InvalidParams(
                "cache and temp directories must differ",
            ));
        }
        fs::create_dir_all(&cache_dir)
            .map_err(|e| TtsError::from(e).with_context("creating cache directory"))?;
        fs::create_dir_all(&temp_dir)
            .map_err(|e| TtsError::from(e).with_context("creating temp directory"))?;

        Ok(Self {
            cache_dir,
            temp_dir,
            preferred_format,
            max_entries: None,
            progressive_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Keep at most `max` artifacts; older ones (by mtime) are evicted after each persist.
    pub fn with_max_entries(mut self, max: NonZeroUsize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn preferred_format(&self) -> AudioFormat {
        self.preferred_format
    }

    /// Final artifact path for `key` in `format`.
    pub fn path_for(&self, key: &RequestKey, format: AudioFormat) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", key.file_stem(), format.extension()))
    }

    /// Fresh transient path for a progressive store of `key`.
    ///
    /// Every call returns a new path, so two stores of one key never share a backing file.
    pub fn progressive_path(&self, key: &RequestKey) -> PathBuf {
        let n = self.progressive_seq.fetch_add(1, Ordering::Relaxed);
        self.temp_dir
            .join(format!("{}.{}.part", key.file_stem(), n))
    }

    fn download_path(&self, key: &RequestKey, format: AudioFormat) -> PathBuf {
        self.temp_dir.join(format!(
            "{}.{}.download",
            key.file_stem(),
            format.extension()
        ))
    }

    /// Look up a complete artifact for `key`, preferred format first.
    ///
    /// Empty files are treated as misses.
    pub fn lookup(&self, key: &RequestKey) -> Option<CacheEntry> {
        let preferred = std::iter::once(self.preferred_format);
        let others = AudioFormat::ALL
            .into_iter()
            .filter(|f| *f != self.preferred_format);

        for format in preferred.chain(others) {
            let path = self.path_for(key, format);
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    trace!("cache: hit key='{}' path='{}'", key, path.display());
                    touch_best_effort(&path);
                    return Some(CacheEntry {
                        key: key.clone(),
                        path,
                        format,
                    });
                }
                _ => continue,
            }
        }

        trace!("cache: miss key='{}'", key);
        None
    }

    /// Atomically persist `bytes` as the artifact for `key`.
    pub fn persist(
        &self,
        key: &RequestKey,
        format: AudioFormat,
        bytes: &[u8],
    ) -> TtsResult<CacheEntry> {
        let mut writer = self.begin(key, format)?;
        writer.write_all(bytes)?;
        writer.commit()
    }

    /// Start writing the artifact for `key`. Nothing is visible until [`CacheWriter::commit`].
    pub fn begin(&self, key: &RequestKey, format: AudioFormat) -> TtsResult<CacheWriter> {
        let temp = self.download_path(key, format);
        let file = fs::File::create(&temp)
            .map_err(|e| TtsError::from(e).with_context("creating cache download file"))?;
        Ok(CacheWriter {
            cache: self.clone(),
            key: key.clone(),
            format,
            temp,
            file: Some(file),
        })
    }

    /// Delete the artifact of `entry`. Missing files are not an error.
    pub fn remove_entry(&self, entry: &CacheEntry) -> TtsResult<()> {
        remove_if_exists(&entry.path)?;
        debug!(key = %entry.key, path = %entry.path.display(), "cache entry removed");
        Ok(())
    }

    /// Delete every artifact of `key`, in any format. Returns how many files were removed.
    pub fn remove(&self, key: &RequestKey) -> TtsResult<usize> {
        let mut removed = 0;
        for format in AudioFormat::ALL {
            if remove_if_exists(&self.path_for(key, format))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// True if `path` lives directly in the cache directory.
    pub fn owns_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.cache_dir.as_path())
    }

    /// Delete everything under the temp directory. Best-effort; returns the number of removed
    /// files.
    ///
    /// Must only be called while no request is in flight.
    pub fn sweep_temp(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.temp_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("cache: sweep failed path='{}': {}", path.display(), e),
                }
            }
        }
        debug!(removed, temp_dir = %self.temp_dir.display(), "temp directory swept");
        removed
    }

    /// Evict the oldest artifacts beyond `max_entries`. Best-effort.
    pub fn evict(&self) -> usize {
        let Some(max) = self.max_entries else {
            return 0;
        };

        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((mtime, e.path()))
            })
            .collect();

        if files.len() <= max.get() {
            return 0;
        }

        files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = files.len() - max.get();
        let mut evicted = 0;
        for (_, path) in files.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    trace!("cache: evicted path='{}'", path.display());
                    evicted += 1;
                }
                Err(e) => warn!("cache: evict failed path='{}': {}", path.display(), e),
            }
        }
        evicted
    }
}

/// In-progress cache write. Dropping it without [`commit`](CacheWriter::commit) discards the
/// partial file.
pub struct CacheWriter {
    cache: CacheStore,
    key: RequestKey,
    format: AudioFormat,
    temp: PathBuf,
    file: Option<fs::File>,
}

impl CacheWriter {
    /// Sync, rename into place and return the new entry.
    pub fn commit(mut self) -> TtsResult<CacheEntry> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let path = self.cache.path_for(&self.key, self.format);
        fs::rename(&self.temp, &path)
            .map_err(|e| TtsError::from(e).with_context("promoting cache file"))?;
        debug!(key = %self.key, path = %path.display(), "cache entry persisted");

        let evicted = self.cache.evict();
        if evicted > 0 {
            debug!(evicted, "cache entries evicted");
        }

        Ok(CacheEntry {
            key: self.key.clone(),
            path,
            format: self.format,
        })
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "cache writer finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = remove_if_exists(&self.temp) {
                warn!(
                    "cache: failed to discard partial file path='{}': {}",
                    self.temp.display(),
                    e
                );
            } else {
                trace!("cache: discarded partial key='{}'", self.key);
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> TtsResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// Bumps mtime for LRU ordering. Failures must not break playback.
fn touch_best_effort(path: &Path) {
    let res = fs::File::options()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = res {
        trace!("cache: touch failed path='{}': {}", path.display(), e);
    }
}
