//! Storage for streamed audio.
//!
//! - [`progressive`]: the growing, file-backed buffer a decoder reads while the network writes.
//! - [`cache`]: the persistent cache of finished artifacts and its transient directory.

pub mod cache;
pub mod progressive;

pub use cache::{CacheEntry, CacheStore, CacheWriter};
pub use progressive::{
    ChunkRegion, Completion, ProgressiveByteStore, ReadOutcome, StoreReader, StoreWriter,
};
