//! Unified crate-level error types.
//!
//! This module provides a single [`TtsError`] type shared by the storage, ingestion and playback
//! crates of the workspace, and a convenient [`TtsResult`] alias.
//!
//! Note: transport and server variants are string-based on purpose so the concrete HTTP client
//! error types do not leak into the public API of the core crate.

use std::io;

use crate::hex::HexDecodeError;

/// Result type used across the workspace.
pub type TtsResult<T> = Result<T, TtsError>;

/// Unified error type for the TTS streaming pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Invalid parameters provided by the caller.
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),

    /// I/O error.
    ///
    /// Uses the concrete `std::io::Error` to preserve error kinds and sources.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A hex audio payload could not be decoded.
    #[error("malformed audio payload: {0}")]
    Decode(#[from] HexDecodeError),

    /// A progressive store was appended to after it had been completed.
    ///
    /// This is a contract violation inside the pipeline, never a user-visible condition.
    #[error("append after completion of store for key {key}")]
    AppendAfterComplete {
        /// Key of the store.
        key: String,
    },

    /// A second reader was opened on a progressive store.
    #[error("store for key {key} already has an open reader")]
    ReaderAlreadyOpen {
        /// Key of the store.
        key: String,
    },

    /// The store was closed and its backing file released.
    #[error("store for key {key} is closed")]
    StoreClosed {
        /// Key of the store.
        key: String,
    },

    /// HTTP request failed with a non-success status and an unparseable body.
    #[error("HTTP error: {status} for {url}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Connection-level failure, including malformed frames.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server reported a rate limit.
    #[error("rate limited ({code}): {msg}")]
    RateLimited {
        /// Server status code.
        code: i64,
        /// Server status message.
        msg: String,
    },

    /// The server reported a non-success status other than a rate limit.
    #[error("server error ({code}): {msg}")]
    Server {
        /// Server status code.
        code: i64,
        /// Server status message.
        msg: String,
    },

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The playback engine failed.
    #[error("playback error: {0}")]
    Playback(String),

    /// Extra context around a lower-level error.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<TtsError>,
    },
}

impl TtsError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        TtsError::Message(msg.into())
    }

    /// Construct a transport error from anything displayable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        TtsError::Transport(err.to_string())
    }

    /// Construct a timeout error for `what` (usually a URL).
    pub fn timeout(what: impl Into<String>) -> Self {
        TtsError::Timeout(what.into())
    }

    /// Attach static context to an existing error.
    pub fn with_context(self, context: &'static str) -> Self {
        TtsError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// Returns true if this error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            TtsError::Cancelled => true,
            TtsError::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
