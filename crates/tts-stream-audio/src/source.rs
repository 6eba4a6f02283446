use std::fmt;
use std::path::PathBuf;

use tts_stream::ProgressiveByteStore;
use url::Url;

/// What the player should read from.
#[derive(Clone)]
pub enum PlaybackSource {
    /// A complete file, usually a cache artifact.
    File(PathBuf),
    /// A remote resource.
    Url(Url),
    /// A store that may still be growing.
    Progressive(ProgressiveByteStore),
}

impl fmt::Debug for PlaybackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackSource::File(path) => f.debug_tuple("File").field(path).finish(),
            PlaybackSource::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            PlaybackSource::Progressive(store) => f
                .debug_struct("Progressive")
                .field("key", store.key())
                .field("written", &store.write_position())
                .field("complete", &store.is_complete())
                .finish(),
        }
    }
}
