//! Server-sent-event ingestion for streamed TTS synthesis.
//!
//! This crate is composed of several modules:
//! - `sse`: incremental event decoder over raw body bytes.
//! - `frame`: JSON frame model and status classification.
//! - `request`: the synthesis request body.
//! - `downloader`: precomputed-URL downloads with retries, backoff and cancellation.
//! - `client`: [`StreamIngestClient`], one task per in-flight request.
//!
//! Storage, keys and the request registry come from `tts-stream`.

mod client;
mod downloader;
mod frame;
mod http;
mod request;
mod sse;

pub use crate::client::{IngestEvent, StartOutcome, StreamIngestClient, cache_from_settings};
pub use crate::downloader::UrlDownloader;
pub use crate::frame::{AudioChunk, StatusPolicy, StreamFrame};
pub use crate::request::{AudioSetting, SynthesisRequest, VoiceSetting};
pub use crate::sse::SseDecoder;
