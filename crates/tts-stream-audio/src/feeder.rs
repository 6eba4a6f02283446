//! Playback feeder.
//!
//! [`PlaybackFeeder`] owns the playback session: which key is active, which source the player
//! reads, and the state machine reported to listeners. Every `play` bumps a generation counter;
//! engine reports and ingest events that belong to an older generation or another key are
//! dropped, so only the most recently requested key ever reaches listeners.
//!
//! Listener callbacks never run on the caller's thread. They are queued in production order and
//! executed one at a time by a dispatch task; [`PlaybackFeeder::flush`] waits for the queue to
//! drain.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use tts_stream::{CacheEntry, CacheStore, ChunkRegion, RequestKey, TtsError, TtsResult};
use tts_stream_sse::IngestEvent;

use crate::listener::{PlaybackListener, PlaybackState};
use crate::player::{EngineEvent, EngineHandle, Player};
use crate::source::PlaybackSource;

type Listeners = Arc<Mutex<Vec<Weak<dyn PlaybackListener>>>>;

#[derive(Debug)]
enum Notification {
    Chunk {
        key: RequestKey,
        region: ChunkRegion,
    },
    CompleteUrl {
        key: RequestKey,
        entry: CacheEntry,
    },
    RateLimit {
        key: RequestKey,
        code: i64,
        msg: String,
    },
    NetError {
        key: RequestKey,
        error: String,
    },
    StateChanged {
        key: RequestKey,
        state: PlaybackState,
    },
    PlayerError {
        key: RequestKey,
        error: String,
    },
}

impl Notification {
    fn deliver(&self, listener: &dyn PlaybackListener) {
        match self {
            Notification::Chunk { key, region } => listener.on_receive_chunk(key, *region),
            Notification::CompleteUrl { key, entry } => {
                listener.on_receive_complete_url(key, entry)
            }
            Notification::RateLimit { key, code, msg } => listener.on_rate_limit(key, *code, msg),
            Notification::NetError { key, error } => listener.on_net_error(key, error),
            Notification::StateChanged { key, state } => {
                listener.on_playback_state_changed(key, *state)
            }
            Notification::PlayerError { key, error } => listener.on_player_error(key, error),
        }
    }
}

enum Dispatch {
    Notify(Notification),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Session {
    active: Option<RequestKey>,
    generation: u64,
    state: PlaybackState,
    source: Option<PlaybackSource>,
}

pub(crate) struct FeederInner {
    player: Arc<dyn Player>,
    cache: Option<CacheStore>,
    session: Mutex<Session>,
    listeners: Listeners,
    dispatch: mpsc::UnboundedSender<Dispatch>,
}

impl FeederInner {
    fn notify(&self, notification: Notification) {
        trace!("feeder: queue {:?}", notification);
        if self.dispatch.send(Dispatch::Notify(notification)).is_err() {
            debug!("feeder: dispatch task gone, dropping notification");
        }
    }

    fn set_state(&self, session: &mut Session, state: PlaybackState) {
        if session.state == state {
            return;
        }
        session.state = state;
        if let Some(key) = &session.active {
            debug!(key = %key, ?state, "playback state changed");
            self.notify(Notification::StateChanged {
                key: key.clone(),
                state,
            });
        }
    }

    pub(crate) fn on_engine_event(&self, key: &RequestKey, generation: u64, event: EngineEvent) {
        let mut session = self.session.lock();
        if session.generation != generation || session.active.as_ref() != Some(key) {
            trace!("feeder: dropping stale engine event {:?} key='{}'", event, key);
            return;
        }

        match event {
            EngineEvent::Started => self.set_state(&mut session, PlaybackState::Playing),
            EngineEvent::Ended => {
                self.set_state(&mut session, PlaybackState::Idle);
                session.source = None;
            }
            EngineEvent::Failed(error) => {
                warn!(key = %key, "player failed: {}", error);
                self.set_state(&mut session, PlaybackState::Error);
                self.notify(Notification::PlayerError {
                    key: key.clone(),
                    error,
                });
                self.set_state(&mut session, PlaybackState::Idle);

                let implicated = session.source.take();
                drop(session);
                self.discard_cache_file(key, implicated);
            }
        }
    }

    /// A cached file that failed to play is removed so the next request goes to the network.
    fn discard_cache_file(&self, key: &RequestKey, source: Option<PlaybackSource>) {
        let (Some(cache), Some(PlaybackSource::File(path))) = (&self.cache, source) else {
            return;
        };
        if !cache.owns_path(&path) {
            return;
        }
        match cache.remove(key) {
            Ok(n) => debug!(key = %key, removed = n, "discarded unplayable cache file"),
            Err(e) => warn!(key = %key, "failed to discard cache file: {}", e),
        }
    }
}

/// Feeds the most recently requested key to a [`Player`] and fans events out to listeners.
#[derive(Clone)]
pub struct PlaybackFeeder {
    inner: Arc<FeederInner>,
}

impl std::fmt::Debug for PlaybackFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("PlaybackFeeder")
            .field("active", &session.active)
            .field("generation", &session.generation)
            .field("state", &session.state)
            .finish_non_exhaustive()
    }
}

impl PlaybackFeeder {
    /// Create a feeder driving `player`.
    ///
    /// With a `cache`, files of that cache that fail to play are deleted. Must be called from
    /// within a tokio runtime; the dispatch task is spawned onto it.
    pub fn new(player: Arc<dyn Player>, cache: Option<CacheStore>) -> TtsResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| TtsError::InvalidParams("feeder must be created inside a tokio runtime"))?;
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_loop(rx, Arc::clone(&listeners)));

        Ok(Self {
            inner: Arc::new(FeederInner {
                player,
                cache,
                session: Mutex::new(Session::default()),
                listeners,
                dispatch: tx,
            }),
        })
    }

    /// Make `key` the active key and start playing `source`.
    ///
    /// The previous source is released; events of the previous key are dropped from now on. Its
    /// network request is not affected.
    pub fn play(&self, key: RequestKey, source: PlaybackSource) {
        let handle = {
            let mut session = self.inner.session.lock();
            if session.active.as_ref() != Some(&key) {
                self.inner.set_state(&mut session, PlaybackState::Idle);
            }
            session.generation += 1;
            session.active = Some(key.clone());
            session.source = Some(source.clone());
            // Force a Loading notification for the new session even on replay of the same key.
            session.state = PlaybackState::Idle;
            self.inner.set_state(&mut session, PlaybackState::Loading);

            debug!(key = %key, generation = session.generation, source = ?source, "play");
            EngineHandle {
                feeder: Arc::downgrade(&self.inner),
                key,
                generation: session.generation,
            }
        };

        self.inner.player.stop();
        if let Err(e) = self.inner.player.load(source, handle.clone()) {
            handle.failed(e.to_string());
        }
    }

    /// Stop playback. The active key becomes `None`.
    pub fn stop(&self) {
        {
            let mut session = self.inner.session.lock();
            self.inner.set_state(&mut session, PlaybackState::Idle);
            session.generation += 1;
            session.active = None;
            session.source = None;
        }
        self.inner.player.stop();
    }

    /// True only for the active key while it is loading or playing.
    pub fn is_playing(&self, key: &RequestKey) -> bool {
        let session = self.inner.session.lock();
        session.active.as_ref() == Some(key)
            && matches!(
                session.state,
                PlaybackState::Loading | PlaybackState::Playing
            )
    }

    pub fn is_active(&self, key: &RequestKey) -> bool {
        self.inner.session.lock().active.as_ref() == Some(key)
    }

    pub fn active_key(&self) -> Option<RequestKey> {
        self.inner.session.lock().active.clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.session.lock().state
    }

    pub fn current_source(&self) -> Option<PlaybackSource> {
        self.inner.session.lock().source.clone()
    }

    /// Register `listener`. It is held weakly; registering the same listener twice is a no-op.
    ///
    /// Returns false if it was already registered.
    pub fn add_listener(&self, listener: &Arc<dyn PlaybackListener>) -> bool {
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        let ptr = Arc::as_ptr(listener);
        if listeners.iter().any(|l| std::ptr::addr_eq(l.as_ptr(), ptr)) {
            return false;
        }
        listeners.push(Arc::downgrade(listener));
        true
    }

    /// Returns true if `listener` was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn PlaybackListener>) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let ptr = Arc::as_ptr(listener);
        let before = listeners.len();
        listeners.retain(|l| l.strong_count() > 0 && !std::ptr::addr_eq(l.as_ptr(), ptr));
        listeners.len() != before
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    /// Forward an ingest event to listeners if it belongs to the active key.
    ///
    /// Returns false if the event was dropped as stale.
    pub fn handle_ingest(&self, event: &IngestEvent) -> bool {
        let session = self.inner.session.lock();
        if session.active.as_ref() != Some(event.key()) {
            trace!("feeder: dropping event of inactive key='{}'", event.key());
            return false;
        }

        let notification = match event {
            IngestEvent::ChunkReceived { key, region, .. } => Notification::Chunk {
                key: key.clone(),
                region: *region,
            },
            IngestEvent::ReceivedUrl { key, entry, .. } => Notification::CompleteUrl {
                key: key.clone(),
                entry: entry.clone(),
            },
            IngestEvent::RateLimited { key, code, msg } => Notification::RateLimit {
                key: key.clone(),
                code: *code,
                msg: msg.clone(),
            },
            IngestEvent::ServerError {
                key, code, msg, ..
            } => Notification::NetError {
                key: key.clone(),
                error: format!("server error {code}: {msg}"),
            },
            IngestEvent::NetError { key, error } => Notification::NetError {
                key: key.clone(),
                error: error.clone(),
            },
            IngestEvent::ExistingCache { .. }
            | IngestEvent::Completed { .. }
            | IngestEvent::Cancelled { .. } => return true,
        };
        self.inner.notify(notification);
        true
    }

    /// Wait until every callback queued so far has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.dispatch.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, listeners: Listeners) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Notify(notification) => {
                let live: Vec<Arc<dyn PlaybackListener>> = {
                    let mut guard = listeners.lock();
                    guard.retain(|l| l.strong_count() > 0);
                    guard.iter().filter_map(Weak::upgrade).collect()
                };
                for listener in &live {
                    notification.deliver(listener.as_ref());
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("feeder: dispatch task finished");
}
