use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, warn};

use tts_stream::{ProgressiveByteStore, StoreReader, TtsError, TtsResult};

use crate::player::{EngineHandle, Player};
use crate::reader::PollingReader;
use crate::source::PlaybackSource;

const TICK: Duration = Duration::from_millis(50);
const POLL_INTERVAL: Duration = Duration::from_millis(5);
// The mixer drops a stopped decoder (and its store reader) lazily.
const REOPEN_ATTEMPTS: u32 = 40;

enum Command {
    Load(PlaybackSource, EngineHandle),
    Stop,
}

struct Current {
    sink: Sink,
    handle: EngineHandle,
}

/// [`Player`] backed by rodio, running on a dedicated thread.
///
/// Progressive sources are read through a [`PollingReader`], so the decoder sees a blocking
/// stream and the waiting happens on the player thread only. Remote URLs are not supported.
pub struct RodioPlayer {
    tx: mpsc::Sender<Command>,
    // Stop flag of the reader currently feeding the decoder, if progressive.
    reader_stop: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl RodioPlayer {
    /// Spawn the player thread. Fails if the thread cannot be created.
    pub fn new() -> TtsResult<Self> {
        let (tx, rx) = mpsc::channel();
        let reader_stop = Arc::new(Mutex::new(None));
        let stop_slot = Arc::clone(&reader_stop);
        thread::Builder::new()
            .name("tts-rodio".into())
            .spawn(move || run(rx, stop_slot))
            .map_err(|e| TtsError::from(e).with_context("spawning player thread"))?;
        Ok(Self { tx, reader_stop })
    }

    fn interrupt_reader(&self) {
        if let Some(flag) = self.reader_stop.lock().take() {
            flag.store(true, Ordering::Release);
        }
    }
}

impl Player for RodioPlayer {
    fn load(&self, source: PlaybackSource, handle: EngineHandle) -> TtsResult<()> {
        self.interrupt_reader();
        self.tx
            .send(Command::Load(source, handle))
            .map_err(|_| TtsError::Playback("player thread stopped".into()))
    }

    fn stop(&self) {
        self.interrupt_reader();
        let _ = self.tx.send(Command::Stop);
    }
}

fn run(rx: mpsc::Receiver<Command>, reader_stop: Arc<Mutex<Option<Arc<AtomicBool>>>>) {
    let output = match OutputStreamBuilder::open_default_stream() {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("rodio: no output device: {}", e);
            None
        }
    };
    let mut current: Option<Current> = None;

    loop {
        match rx.recv_timeout(TICK) {
            Ok(Command::Load(source, handle)) => {
                stop_current(&mut current);
                let Some(output) = output.as_ref() else {
                    handle.failed("no audio output device");
                    continue;
                };
                match open(output, source, &reader_stop) {
                    Ok(sink) => {
                        handle.started();
                        current = Some(Current { sink, handle });
                    }
                    Err(e) => handle.failed(e.to_string()),
                }
            }
            Ok(Command::Stop) => stop_current(&mut current),
            Err(RecvTimeoutError::Timeout) => {
                if current.as_ref().is_some_and(|c| c.sink.empty()) {
                    if let Some(done) = current.take() {
                        debug!(key = %done.handle.key(), "rodio: playback ended");
                        done.handle.ended();
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stop_current(&mut current);
    debug!("rodio: player thread finished");
}

fn stop_current(current: &mut Option<Current>) {
    if let Some(c) = current.take() {
        c.sink.stop();
    }
}

fn open(
    output: &OutputStream,
    source: PlaybackSource,
    reader_stop: &Mutex<Option<Arc<AtomicBool>>>,
) -> TtsResult<Sink> {
    let sink = Sink::connect_new(output.mixer());
    match source {
        PlaybackSource::File(path) => {
            let file = File::open(&path)
                .map_err(|e| TtsError::from(e).with_context("opening audio file"))?;
            let decoder = Decoder::new(BufReader::new(file))
                .map_err(|e| TtsError::Playback(e.to_string()))?;
            sink.append(decoder);
        }
        PlaybackSource::Progressive(store) => {
            let reader = PollingReader::new(open_reader(&store)?, POLL_INTERVAL);
            *reader_stop.lock() = Some(reader.stop_flag());
            let decoder = Decoder::new(reader).map_err(|e| TtsError::Playback(e.to_string()))?;
            sink.append(decoder);
        }
        PlaybackSource::Url(url) => {
            return Err(TtsError::Playback(format!(
                "remote sources are not supported: {url}"
            )));
        }
    }
    Ok(sink)
}

/// Open the store's reader, waiting for the previous session's reader to be released.
fn open_reader(store: &ProgressiveByteStore) -> TtsResult<StoreReader> {
    let mut attempt = 0;
    loop {
        match store.open() {
            Err(TtsError::ReaderAlreadyOpen { .. }) if attempt < REOPEN_ATTEMPTS => {
                attempt += 1;
                thread::sleep(POLL_INTERVAL);
            }
            other => return other,
        }
    }
}
