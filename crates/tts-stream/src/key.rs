//! Request keys.
//!
//! A [`RequestKey`] is the join key across ingestion, caching and playback. Keys built from text
//! are the lowercase hex SHA-256 of their inputs, so they are stable across processes and
//! toolchains (unlike `DefaultHasher`).

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::trace;

/// Stable identifier of one synthesis request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(pub Arc<str>);

impl RequestKey {
    /// Wrap an already-derived key.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Derive a key from the text alone.
    pub fn from_text(text: &str) -> Self {
        Self::from_parts(&[text])
    }

    /// Derive a key from the text plus every parameter that changes the produced audio
    /// (model, voice, format, ...).
    ///
    /// Parts are length-prefixed before hashing so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn from_parts(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let key = crate::hex::encode_hex(&hasher.finalize());
        trace!("request_key: derived key='{}' parts={}", key, parts.len());
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the key, used to build cache and temp paths.
    ///
    /// Path separators and other characters outside `[A-Za-z0-9._-]` become `_`, and a key
    /// made only of dots is prefixed so it can never name `.` or `..`.
    pub fn file_stem(&self) -> String {
        let mut out: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if out.is_empty() || out.chars().all(|c| c == '.') {
            out.insert(0, '_');
        }
        out
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequestKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
