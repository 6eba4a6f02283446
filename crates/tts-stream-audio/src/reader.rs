use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tts_stream::StoreReader;

/// Blocking `Read + Seek` view of a growing store, for decoders that cannot handle
/// `WouldBlock`.
///
/// Sleeps `poll_interval` between empty polls, so it must only be used on a thread dedicated to
/// playback. Setting the stop flag turns every pending read into end-of-stream.
#[derive(Debug)]
pub struct PollingReader {
    inner: StoreReader,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl PollingReader {
    pub fn new(inner: StoreReader, poll_interval: Duration) -> Self {
        Self {
            inner,
            poll_interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends blocking reads when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wait until `pos` bytes are written or the store completed. Returns false if stopped.
    fn wait_for(&self, pos: u64) -> bool {
        while self.inner.write_position() < pos && !self.inner.is_complete() {
            if self.stopped() {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
        true
    }
}

impl Read for PollingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let out = self.inner.read(buf)?;
            if !out.is_pending() {
                return Ok(out.bytes_read);
            }
            if self.stopped() {
                return Ok(0);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl Seek for PollingReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let interrupted = || io::Error::new(io::ErrorKind::Interrupted, "playback stopped");
        match pos {
            SeekFrom::End(_) => {
                if !self.wait_for(u64::MAX) {
                    return Err(interrupted());
                }
            }
            SeekFrom::Start(p) => {
                if !self.wait_for(p) {
                    return Err(interrupted());
                }
            }
            SeekFrom::Current(d) => {
                let target = self.inner.position().saturating_add_signed(d);
                if !self.wait_for(target) {
                    return Err(interrupted());
                }
            }
        }
        self.inner.seek(pos)
    }
}
