//! Contract between the feeder and an audio engine.
//!
//! The feeder hands the engine a [`PlaybackSource`] together with an [`EngineHandle`]. The engine
//! reports progress through the handle from whatever thread it runs on. Every handle is bound to
//! one `play` call, so reports from a replaced session are recognized and dropped.

use std::sync::Weak;

use tts_stream::{RequestKey, TtsResult};

use crate::feeder::FeederInner;
use crate::source::PlaybackSource;

/// Engine lifecycle report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Audio started to come out.
    Started,
    /// The source was played to its end.
    Ended,
    /// The engine could not open or decode the source.
    Failed(String),
}

/// An audio engine able to play one source at a time.
pub trait Player: Send + Sync {
    /// Start playing `source`, replacing whatever was loaded.
    ///
    /// Must not block on the source. An `Err` is reported like [`EngineEvent::Failed`].
    fn load(&self, source: PlaybackSource, handle: EngineHandle) -> TtsResult<()>;

    /// Stop playback and release the current source.
    fn stop(&self);
}

/// Reporting channel from an engine back to the feeder that loaded it.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) feeder: Weak<FeederInner>,
    pub(crate) key: RequestKey,
    pub(crate) generation: u64,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl EngineHandle {
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an engine event. Ignored once the feeder moved on or was dropped.
    pub fn report(&self, event: EngineEvent) {
        if let Some(feeder) = self.feeder.upgrade() {
            feeder.on_engine_event(&self.key, self.generation, event);
        }
    }

    pub fn started(&self) {
        self.report(EngineEvent::Started);
    }

    pub fn ended(&self) {
        self.report(EngineEvent::Ended);
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.report(EngineEvent::Failed(error.into()));
    }
}
