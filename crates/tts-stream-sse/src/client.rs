//! Streaming ingestion client.
//!
//! [`StreamIngestClient::start`] is idempotent per key: a cached key is answered from disk, an
//! in-flight key is left alone, and anything else gets exactly one streamed connection running
//! on its own task. The task decodes audio frames into the key's [`ProgressiveByteStore`] and
//! persists the final chunk into the cache.
//!
//! Finalization order of a request is fixed:
//! 1. the cache artifact (if any) is persisted,
//! 2. the request is released from the [`RequestRegistry`],
//! 3. the store is completed.
//!
//! A playback side that asks for the live store therefore either gets a store that will be
//! completed, or finds the request gone and the cache already populated.

use std::io::Write;
use std::sync::Arc;

use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use tts_stream::{
    CacheEntry, CacheStore, ChunkRegion, Completion, ProgressiveByteStore, Registration,
    RequestKey, RequestRegistry, StoreWriter, TtsError, TtsResult, TtsSettings, decode_hex,
};

use crate::downloader::UrlDownloader;
use crate::frame::{AudioChunk, StatusPolicy, StreamFrame};
use crate::http::{body_stream, next_chunk};
use crate::request::SynthesisRequest;
use crate::sse::SseDecoder;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted by the ingestion side, in per-key arrival order.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    /// `start` found a complete cache artifact; no connection was opened.
    ExistingCache { key: RequestKey, entry: CacheEntry },
    /// Decoded audio was appended to the live store.
    ChunkReceived {
        key: RequestKey,
        trace_id: Option<String>,
        region: ChunkRegion,
        store: ProgressiveByteStore,
        is_final: bool,
    },
    /// A precomputed resource was downloaded into the cache.
    ReceivedUrl {
        key: RequestKey,
        url: String,
        entry: CacheEntry,
    },
    RateLimited {
        key: RequestKey,
        code: i64,
        msg: String,
    },
    ServerError {
        key: RequestKey,
        code: i64,
        msg: String,
        terminal: bool,
    },
    /// Connection-level failure or an unparseable frame.
    NetError { key: RequestKey, error: String },
    /// The request ended. `entry` is set when a cache artifact was produced.
    Completed {
        key: RequestKey,
        completion: Completion,
        entry: Option<CacheEntry>,
    },
    Cancelled { key: RequestKey },
}

impl IngestEvent {
    pub fn key(&self) -> &RequestKey {
        match self {
            IngestEvent::ExistingCache { key, .. }
            | IngestEvent::ChunkReceived { key, .. }
            | IngestEvent::ReceivedUrl { key, .. }
            | IngestEvent::RateLimited { key, .. }
            | IngestEvent::ServerError { key, .. }
            | IngestEvent::NetError { key, .. }
            | IngestEvent::Completed { key, .. }
            | IngestEvent::Cancelled { key } => key,
        }
    }
}

/// Result of [`StreamIngestClient::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    CacheHit(CacheEntry),
    AlreadyInFlight,
    Started,
}

struct Inner {
    settings: TtsSettings,
    endpoint: Url,
    http: Client,
    cache: CacheStore,
    registry: Arc<RequestRegistry>,
    policy: StatusPolicy,
    events: broadcast::Sender<IngestEvent>,
    runtime: Handle,
}

impl Inner {
    fn emit(&self, event: IngestEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Client for the streaming synthesis endpoint. Cheap to clone.
#[derive(Clone)]
pub struct StreamIngestClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamIngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIngestClient")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl StreamIngestClient {
    /// Create a client with its own cache and registry.
    ///
    /// Must be called from within a tokio runtime; request tasks are spawned onto it.
    pub fn new(settings: TtsSettings) -> TtsResult<Self> {
        let cache = cache_from_settings(&settings)?;
        Self::with_parts(settings, cache, Arc::new(RequestRegistry::new()))
    }

    /// Create a client over an existing cache and registry.
    pub fn with_parts(
        settings: TtsSettings,
        cache: CacheStore,
        registry: Arc<RequestRegistry>,
    ) -> TtsResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| TtsError::InvalidParams("client must be created inside a tokio runtime"))?;
        let endpoint = Url::parse(&settings.endpoint)
            .map_err(|_| TtsError::InvalidParams("endpoint is not a valid URL"))?;
        let http = Client::builder()
            .connect_timeout(settings.request_timeout)
            .build()
            .map_err(TtsError::transport)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        debug!(endpoint = %endpoint, "ingest client created");
        Ok(Self {
            inner: Arc::new(Inner {
                policy: StatusPolicy::from_settings(&settings),
                settings,
                endpoint,
                http,
                cache,
                registry,
                events,
                runtime,
            }),
        })
    }

    pub fn settings(&self) -> &TtsSettings {
        &self.inner.settings
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    /// Subscribe to ingestion events of every key.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.inner.events.subscribe()
    }

    /// Key of `text` under this client's settings.
    pub fn request_key(&self, text: &str) -> RequestKey {
        self.inner.settings.request_key(text)
    }

    /// Start synthesizing `text` under `key`. Never blocks on the network.
    pub fn start(&self, key: RequestKey, text: impl Into<String>) -> StartOutcome {
        let inner = &self.inner;

        if let Some(entry) = self.cache_hit(&key) {
            return StartOutcome::CacheHit(entry);
        }

        let Some(reg) = inner.registry.try_register(&key) else {
            debug!(key = %key, "start: request already in flight");
            return StartOutcome::AlreadyInFlight;
        };

        // A request for the same key may have finished between the lookup and the registration.
        if let Some(entry) = inner.cache.lookup(&key) {
            inner.registry.release(&reg);
            inner.registry.record_cache_hit();
            inner.emit(IngestEvent::ExistingCache {
                key,
                entry: entry.clone(),
            });
            return StartOutcome::CacheHit(entry);
        }

        let task = IngestTask {
            inner: Arc::clone(inner),
            reg,
            text: text.into(),
            store: None,
            writer: None,
            detached: false,
            final_seen: false,
        };
        inner.runtime.spawn(task.run());
        StartOutcome::Started
    }

    /// Cancel the in-flight request for `key`. Returns true if one was running.
    ///
    /// The connection is torn down, the live store ends as [`Completion::Cancelled`] and nothing
    /// is written to the cache.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        self.inner.registry.cancel(key)
    }

    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.inner.registry.is_in_flight(key)
    }

    /// Live store of an in-flight `key`, created now if no chunk has arrived yet.
    ///
    /// Returns `Ok(None)` when `key` is not in flight.
    pub fn live_store(&self, key: &RequestKey) -> TtsResult<Option<ProgressiveByteStore>> {
        let cache = &self.inner.cache;
        self.inner
            .registry
            .live_store(key, || {
                ProgressiveByteStore::create(key.clone(), cache.progressive_path(key))
            })
            .transpose()
    }

    /// Cancel every in-flight request.
    pub fn cancel_all(&self) -> usize {
        self.inner.registry.cancel_all()
    }

    fn cache_hit(&self, key: &RequestKey) -> Option<CacheEntry> {
        let inner = &self.inner;
        let entry = inner.cache.lookup(key)?;
        inner.registry.record_cache_hit();
        debug!(key = %key, path = %entry.path.display(), "start: cache hit");
        inner.emit(IngestEvent::ExistingCache {
            key: key.clone(),
            entry: entry.clone(),
        });
        Some(entry)
    }
}

/// Build the cache described by `settings`.
pub fn cache_from_settings(settings: &TtsSettings) -> TtsResult<CacheStore> {
    let cache = CacheStore::new(&settings.cache_dir, &settings.temp_dir, settings.format)?;
    Ok(match settings.max_cached_entries.and_then(std::num::NonZeroUsize::new) {
        Some(max) => cache.with_max_entries(max),
        None => cache,
    })
}

/// How a request's frame loop ended.
#[derive(Debug)]
enum Ending {
    /// The final chunk arrived. Carries its cache artifact if it had audio.
    Final(Option<CacheEntry>),
    /// A precomputed resource was downloaded.
    Url(CacheEntry),
    /// The body ended without a final chunk.
    Closed,
    /// A terminal server status.
    Terminal,
    /// Non-success HTTP response whose body was classified.
    Rejected,
}

enum Flow {
    Continue,
    Stop(Ending),
}

struct IngestTask {
    inner: Arc<Inner>,
    reg: Registration,
    text: String,
    store: Option<ProgressiveByteStore>,
    writer: Option<StoreWriter>,
    // The store was closed under us; stop appending but keep reading for the final chunk.
    detached: bool,
    final_seen: bool,
}

impl IngestTask {
    fn key(&self) -> &RequestKey {
        &self.reg.key
    }

    #[instrument(skip_all, fields(key = %self.reg.key, id = self.reg.id))]
    async fn run(mut self) {
        debug!("ingest task started");
        let result = self.stream().await;
        self.finish(result);
    }

    async fn stream(&mut self) -> TtsResult<Ending> {
        let inner = Arc::clone(&self.inner);
        let url = inner.endpoint.as_str();
        let cancel = self.reg.token.clone();

        let body = SynthesisRequest::new(&inner.settings, &self.text);
        let mut request = inner.http.post(inner.endpoint.clone()).json(&body);
        if !inner.settings.api_key.is_empty() {
            request = request.bearer_auth(&inner.settings.api_key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TtsError::Cancelled),
            res = timeout(inner.settings.request_timeout, request.send()) => match res {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(TtsError::transport(e)),
                Err(_) => return Err(TtsError::timeout(url)),
            },
        };

        let status = response.status();
        let mut decoder = SseDecoder::new();
        let mut body = body_stream(response);

        if !status.is_success() {
            // Error bodies are plain JSON; classify them like stream frames.
            debug!(status = status.as_u16(), "non-success response");
            let mut frames = 0usize;
            while let Some(bytes) =
                next_chunk(&mut body, &cancel, inner.settings.idle_timeout, url).await?
            {
                for payload in decoder.push(&bytes) {
                    frames += 1;
                    if let Flow::Stop(ending) = self.handle_payload(&payload).await? {
                        return Ok(ending);
                    }
                }
            }
            for payload in decoder.finish() {
                frames += 1;
                if let Flow::Stop(ending) = self.handle_payload(&payload).await? {
                    return Ok(ending);
                }
            }
            if frames == 0 {
                return Err(TtsError::HttpError {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            return Ok(Ending::Rejected);
        }

        loop {
            let next = next_chunk(&mut body, &cancel, inner.settings.idle_timeout, url).await;
            let bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    trace!("body ended, draining {} buffered bytes", decoder.pending_bytes());
                    return self.drain(&mut decoder, Ok(Ending::Closed)).await;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("connection failed: {}", e);
                    return self.drain(&mut decoder, Err(e)).await;
                }
            };

            for payload in decoder.push(&bytes) {
                if let Flow::Stop(ending) = self.handle_payload(&payload).await? {
                    return Ok(ending);
                }
            }
        }
    }

    /// Process buffered-but-unterminated payloads once, then end with `otherwise` unless one of
    /// them ended the request.
    async fn drain(
        &mut self,
        decoder: &mut SseDecoder,
        otherwise: TtsResult<Ending>,
    ) -> TtsResult<Ending> {
        for payload in decoder.finish() {
            if let Flow::Stop(ending) = self.handle_payload(&payload).await? {
                return Ok(ending);
            }
        }
        otherwise
    }

    async fn handle_payload(&mut self, payload: &str) -> TtsResult<Flow> {
        // A cancelled request must not act on payloads that were already buffered.
        if self.reg.token.is_cancelled() {
            return Err(TtsError::Cancelled);
        }
        let inner = Arc::clone(&self.inner);
        let key = self.key().clone();

        match StreamFrame::parse(payload, &inner.policy) {
            StreamFrame::PrecomputedUrl { trace_id, url } => {
                debug!(trace_id = ?trace_id, url = %url, "precomputed url frame");
                let downloader =
                    UrlDownloader::new(inner.http.clone(), &inner.settings, self.reg.token.clone());
                let entry = downloader
                    .download_to_cache(&url, &inner.cache, &key, inner.settings.format)
                    .await
                    .map_err(|e| e.with_context("downloading precomputed url"))?;
                if self.reg.token.is_cancelled() {
                    self.discard(&entry);
                    return Err(TtsError::Cancelled);
                }
                inner.emit(IngestEvent::ReceivedUrl {
                    key,
                    url,
                    entry: entry.clone(),
                });
                Ok(Flow::Stop(Ending::Url(entry)))
            }
            StreamFrame::RateLimited { code, msg } => {
                warn!(code, msg = %msg, "rate limited");
                inner.emit(IngestEvent::RateLimited { key, code, msg });
                Ok(Flow::Continue)
            }
            StreamFrame::ServerError {
                code,
                msg,
                terminal,
            } => {
                warn!(code, msg = %msg, terminal, "server error");
                inner.emit(IngestEvent::ServerError {
                    key,
                    code,
                    msg,
                    terminal,
                });
                Ok(if terminal {
                    Flow::Stop(Ending::Terminal)
                } else {
                    Flow::Continue
                })
            }
            StreamFrame::TransportError { msg } => {
                warn!("dropping frame: {}", msg);
                inner.emit(IngestEvent::NetError { key, error: msg });
                Ok(Flow::Continue)
            }
            StreamFrame::AudioChunk(chunk) => self.handle_chunk(chunk).await,
        }
    }

    async fn handle_chunk(&mut self, chunk: AudioChunk) -> TtsResult<Flow> {
        if self.final_seen {
            warn!("ignoring chunk after final chunk");
            return Ok(Flow::Continue);
        }

        let bytes = match decode_hex(&chunk.hex) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(trace_id = ?chunk.trace_id, "dropping undecodable chunk: {}", e);
                return Ok(Flow::Continue);
            }
        };
        if bytes.is_empty() && !chunk.is_final {
            trace!("ignoring empty chunk");
            return Ok(Flow::Continue);
        }

        if !bytes.is_empty() {
            self.append(&bytes, &chunk);
        }
        if !chunk.is_final {
            return Ok(Flow::Continue);
        }

        self.final_seen = true;
        if bytes.is_empty() {
            debug!("final chunk without audio");
            return Ok(Flow::Stop(Ending::Final(None)));
        }

        let cache = self.inner.cache.clone();
        let key = self.key().clone();
        let format = self.inner.settings.format;
        let token = self.reg.token.clone();
        let entry = tokio::task::spawn_blocking(move || -> TtsResult<Option<CacheEntry>> {
            let mut writer = cache.begin(&key, format)?;
            writer.write_all(&bytes)?;
            if token.is_cancelled() {
                // Dropping the writer discards the partial file.
                return Ok(None);
            }
            writer.commit().map(Some)
        })
        .await
        .map_err(|e| TtsError::msg(format!("cache persist task failed: {e}")))?
        .map_err(|e| e.with_context("persisting final chunk"))?;

        let Some(entry) = entry else {
            debug!("cancelled before the final chunk was persisted");
            return Err(TtsError::Cancelled);
        };
        debug!(path = %entry.path.display(), "final chunk persisted");
        Ok(Flow::Stop(Ending::Final(Some(entry))))
    }

    fn append(&mut self, bytes: &[u8], chunk: &AudioChunk) {
        if self.detached {
            return;
        }
        if self.writer.is_none() {
            match self.acquire_writer() {
                Some((store, writer)) => {
                    self.store = Some(store);
                    self.writer = Some(writer);
                }
                None => {
                    self.detached = true;
                    return;
                }
            }
        }
        let (Some(store), Some(writer)) = (self.store.as_ref(), self.writer.as_mut()) else {
            return;
        };

        match writer.append(bytes) {
            Ok(region) => self.inner.emit(IngestEvent::ChunkReceived {
                key: self.reg.key.clone(),
                trace_id: chunk.trace_id.clone(),
                region,
                store: store.clone(),
                is_final: chunk.is_final,
            }),
            Err(e) => {
                // The playback side closed the store. Keep ingesting for the cache.
                debug!("store detached: {}", e);
                self.detached = true;
                self.writer = None;
            }
        }
    }

    fn acquire_writer(&self) -> Option<(ProgressiveByteStore, StoreWriter)> {
        let key = self.key();
        let path = self.inner.cache.progressive_path(key);
        match self
            .inner
            .registry
            .attach_store(&self.reg, || ProgressiveByteStore::create(key.clone(), &path))
        {
            Some(Ok(store)) => match store.take_writer() {
                Some(writer) => Some((store, writer)),
                None => {
                    warn!("store writer already taken");
                    None
                }
            },
            Some(Err(e)) => {
                warn!("could not create live store: {}", e);
                None
            }
            None => {
                trace!("request no longer owns its key, not creating store");
                None
            }
        }
    }

    /// Remove an artifact this request produced after it was cancelled.
    fn discard(&self, entry: &CacheEntry) {
        match self.inner.cache.remove_entry(entry) {
            Ok(()) => debug!(path = %entry.path.display(), "discarded artifact of cancelled request"),
            Err(e) => warn!("failed to discard artifact of cancelled request: {}", e),
        }
    }

    fn finish(mut self, result: TtsResult<Ending>) {
        let inner = Arc::clone(&self.inner);
        let key = self.key().clone();
        let released = inner.registry.release(&self.reg);

        // `cancel` fires the token before removing the entry, so this check cannot miss a
        // cancellation that won against `release`.
        let result = if self.reg.token.is_cancelled() {
            if let Ok(Ending::Final(Some(entry)) | Ending::Url(entry)) = &result {
                self.discard(entry);
            }
            Err(TtsError::Cancelled)
        } else {
            result
        };

        let (completion, entry) = match result {
            Ok(Ending::Final(entry)) => (Completion::Finished, entry),
            Ok(Ending::Url(entry)) => (Completion::Finished, Some(entry)),
            Ok(Ending::Closed) => {
                inner.emit(IngestEvent::NetError {
                    key: key.clone(),
                    error: "stream closed before the final chunk".to_string(),
                });
                (Completion::Failed, None)
            }
            Ok(Ending::Terminal | Ending::Rejected) => (Completion::Failed, None),
            Err(e) if e.is_cancelled() => (Completion::Cancelled, None),
            Err(e) => {
                warn!("request failed: {}", e);
                inner.emit(IngestEvent::NetError {
                    key: key.clone(),
                    error: e.to_string(),
                });
                (Completion::Failed, None)
            }
        };

        if let Some(mut writer) = self.writer.take() {
            writer.complete_with(completion);
        }
        if let Some(store) = released.store {
            store.complete_with(completion);
        }

        debug!(?completion, released = released.removed, "ingest task finished");
        if completion == Completion::Cancelled {
            inner.emit(IngestEvent::Cancelled { key });
        } else {
            inner.emit(IngestEvent::Completed {
                key,
                completion,
                entry,
            });
        }
    }
}
