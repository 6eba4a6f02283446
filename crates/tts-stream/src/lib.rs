//! Core storage and bookkeeping for streamed text-to-speech audio.
//!
//! Audio for one synthesis request arrives as a sequence of hex-encoded chunks. This crate holds
//! everything needed to play those chunks while they are still arriving, without knowing about
//! HTTP or the audio engine:
//! - `storage::progressive`: a file-backed, append-only byte store with one writer and one
//!   non-blocking reader ([`ProgressiveByteStore`]).
//! - `storage::cache`: the on-disk cache of completed audio with atomic promotion
//!   ([`CacheStore`]).
//! - `registry`: the concurrent map of in-flight requests ([`RequestRegistry`]).
//! - `key`: stable request keys ([`RequestKey`]).
//! - `settings`: the flattened [`TtsSettings`].
//! - `error`: the unified [`TtsError`].
//!
//! The protocol client lives in `tts-stream-sse`, the playback side in `tts-stream-audio`.

mod error;
mod format;
mod hex;
mod key;
mod registry;
mod settings;
mod storage;

pub use crate::error::{TtsError, TtsResult};
pub use crate::format::AudioFormat;
pub use crate::hex::{HexDecodeError, decode_hex, encode_hex};
pub use crate::key::RequestKey;
pub use crate::registry::{Registration, Released, RequestRegistry};
pub use crate::settings::TtsSettings;

// Progressive (in-flight) storage.
pub use crate::storage::{
    ChunkRegion, Completion, ProgressiveByteStore, ReadOutcome, StoreReader, StoreWriter,
};

// Completed-audio cache.
pub use crate::storage::{CacheEntry, CacheStore, CacheWriter};
