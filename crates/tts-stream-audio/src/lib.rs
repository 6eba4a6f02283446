//! Progressive playback for streamed TTS audio.
//!
//! - `source`: what a player reads ([`PlaybackSource`]).
//! - `player`: the engine contract ([`Player`], [`EngineHandle`]).
//! - `feeder`: [`PlaybackFeeder`], active-key tracking and ordered listener dispatch.
//! - `reader`: a blocking view of a growing store for decoders.
//! - `service`: [`SpeechService`], the explicitly constructed facade.
//! - `rodio_player` (feature `rodio`): a rodio-backed [`Player`].

mod feeder;
mod listener;
mod player;
mod reader;
mod service;
mod source;

#[cfg(feature = "rodio")]
mod rodio_player;

pub use crate::feeder::PlaybackFeeder;
pub use crate::listener::{PlaybackListener, PlaybackState};
pub use crate::player::{EngineEvent, EngineHandle, Player};
pub use crate::reader::PollingReader;
pub use crate::service::SpeechService;
pub use crate::source::PlaybackSource;

#[cfg(feature = "rodio")]
pub use crate::rodio_player::RodioPlayer;
