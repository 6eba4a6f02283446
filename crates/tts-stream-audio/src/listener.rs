use tts_stream::{CacheEntry, ChunkRegion, RequestKey};

/// Playback state of the active key.
///
/// Transitions: `Idle -> Loading -> Playing -> Idle` and `Idle -> Loading -> Error -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Error,
}

/// Observer of one feeder. Callbacks are fire-and-forget and run on the feeder's dispatch task,
/// one at a time, in the order the feeder produced them.
///
/// Only events of the active key are delivered.
#[allow(unused_variables)]
pub trait PlaybackListener: Send + Sync {
    fn on_receive_chunk(&self, key: &RequestKey, region: ChunkRegion) {}

    fn on_receive_complete_url(&self, key: &RequestKey, entry: &CacheEntry) {}

    fn on_rate_limit(&self, key: &RequestKey, code: i64, msg: &str) {}

    fn on_net_error(&self, key: &RequestKey, error: &str) {}

    fn on_playback_state_changed(&self, key: &RequestKey, state: PlaybackState) {}

    fn on_player_error(&self, key: &RequestKey, error: &str) {}
}
