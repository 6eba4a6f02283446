//! Speech service.
//!
//! [`SpeechService`] wires one ingest client, one feeder and one registry together and is passed
//! explicitly to whoever needs it. `speak` derives the request key, starts ingestion and plays
//! either the cached file or the live store while it is still growing.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tts_stream::{CacheEntry, RequestKey, RequestRegistry, TtsError, TtsResult, TtsSettings};
use tts_stream_sse::{IngestEvent, StartOutcome, StreamIngestClient, cache_from_settings};

use crate::feeder::PlaybackFeeder;
use crate::listener::PlaybackListener;
use crate::player::Player;
use crate::source::PlaybackSource;

/// Explicitly constructed facade over ingestion and playback.
pub struct SpeechService {
    client: StreamIngestClient,
    feeder: PlaybackFeeder,
    shutdown: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SpeechService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechService")
            .field("client", &self.client)
            .field("feeder", &self.feeder)
            .finish_non_exhaustive()
    }
}

impl SpeechService {
    /// Build the service. Leftover transient files of a previous run are swept first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: TtsSettings, player: Arc<dyn Player>) -> TtsResult<Self> {
        let cache = cache_from_settings(&settings)?;
        let swept = cache.sweep_temp();
        if swept > 0 {
            debug!(swept, "removed stale transient files");
        }

        let registry = Arc::new(RequestRegistry::new());
        let client = StreamIngestClient::with_parts(settings, cache.clone(), registry)?;
        let feeder = PlaybackFeeder::new(player, Some(cache))?;

        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            client.subscribe(),
            feeder.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            feeder,
            shutdown,
            pump: Some(pump),
        })
    }

    pub fn client(&self) -> &StreamIngestClient {
        &self.client
    }

    pub fn feeder(&self) -> &PlaybackFeeder {
        &self.feeder
    }

    /// Speak `text`: start (or join) its request and play it. Returns the request key.
    pub fn speak(&self, text: &str) -> TtsResult<RequestKey> {
        let key = self.client.request_key(text);
        self.speak_as(key.clone(), text)?;
        Ok(key)
    }

    /// Like [`speak`](Self::speak) with an explicit key.
    pub fn speak_as(&self, key: RequestKey, text: &str) -> TtsResult<()> {
        let source = match self.client.start(key.clone(), text) {
            StartOutcome::CacheHit(entry) => PlaybackSource::File(entry.path),
            StartOutcome::Started | StartOutcome::AlreadyInFlight => self.resolve_source(&key)?,
        };
        self.feeder.play(key, source);
        Ok(())
    }

    /// The live store if the request is still running, otherwise the cache artifact.
    fn resolve_source(&self, key: &RequestKey) -> TtsResult<PlaybackSource> {
        if let Some(store) = self.client.live_store(key)? {
            return Ok(PlaybackSource::Progressive(store));
        }
        match self.client.cache().lookup(key) {
            Some(entry) => Ok(PlaybackSource::File(entry.path)),
            None => Err(TtsError::msg(format!("no audio available for key {key}"))),
        }
    }

    /// Stop playback. Running requests continue and still populate the cache.
    pub fn stop(&self) {
        self.feeder.stop();
    }

    /// Cancel the request for `key` and stop playing it if it is active.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let cancelled = self.client.cancel(key);
        if self.feeder.is_active(key) {
            self.feeder.stop();
        }
        cancelled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.client.subscribe()
    }

    pub fn add_listener(&self, listener: &Arc<dyn PlaybackListener>) -> bool {
        self.feeder.add_listener(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PlaybackListener>) -> bool {
        self.feeder.remove_listener(listener)
    }

    /// Cancel all requests, stop playback and wait for queued callbacks.
    pub async fn shutdown(mut self) {
        let cancelled = self.client.cancel_all();
        self.feeder.stop();
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        self.feeder.flush().await;
        debug!(cancelled, "speech service shut down");
    }
}

impl Drop for SpeechService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump_events(
    mut events: broadcast::Receiver<IngestEvent>,
    feeder: PlaybackFeeder,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            ev = events.recv() => ev,
        };
        match event {
            Ok(event) => {
                if let IngestEvent::ReceivedUrl { key, entry, .. } = &event {
                    switch_to_downloaded(&feeder, key, entry);
                }
                feeder.handle_ingest(&event);
            }
            Err(RecvError::Lagged(n)) => warn!("speech service lagged, {} events skipped", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// A precomputed resource replaces a live store that never received audio.
fn switch_to_downloaded(feeder: &PlaybackFeeder, key: &RequestKey, entry: &CacheEntry) {
    if !feeder.is_active(key) {
        return;
    }
    if let Some(PlaybackSource::Progressive(store)) = feeder.current_source() {
        if store.write_position() == 0 {
            debug!(key = %key, "switching to downloaded resource");
            feeder.play(key.clone(), PlaybackSource::File(entry.path.clone()));
        }
    }
}
