//! Unified configuration for the TTS streaming workspace.
//!
//! One flattened struct covers every configuration domain:
//! - synthesis request parameters (endpoint, credentials, voice and audio settings)
//! - HTTP behavior (timeouts, retries, backoff)
//! - on-disk layout (cache and temp directories, cache bound)
//! - server status classification (rate-limit and fatal codes)
//!
//! Notes:
//! - `Debug` never prints the api key.
//! - [`TtsSettings::with_env_overrides`] lets deployments inject credentials without code changes.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::format::AudioFormat;
use crate::key::RequestKey;

/// Unified settings for TTS streaming.
#[derive(Clone)]
pub struct TtsSettings {
    // ----------------------------
    // Synthesis request
    // ----------------------------
    /// Streaming synthesis endpoint.
    pub endpoint: String,

    /// Bearer token sent with every request. Never logged.
    pub api_key: String,

    /// Model name sent in the request body.
    pub model: String,

    /// Voice identifier.
    pub voice_id: String,

    /// Speech speed multiplier. Default: 1.0.
    pub speed: f32,

    /// Output volume. Default: 1.0.
    pub vol: f32,

    /// Pitch offset in semitones. Default: 0.
    pub pitch: i32,

    /// Output sample rate in Hz. Default: 32000.
    pub sample_rate: u32,

    /// Output bitrate in bit/s. Default: 128000.
    pub bitrate: u32,

    /// Number of output channels. Default: 1.
    pub channel: u8,

    /// Audio container requested from the server and used for cached files.
    pub format: AudioFormat,

    // ----------------------------
    // HTTP behavior
    // ----------------------------
    /// Timeout for establishing a request and receiving response headers.
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Maximum silence between two body chunks before the connection is considered dead.
    /// Default: 30 seconds.
    pub idle_timeout: Duration,

    /// Maximum number of retry attempts for precomputed-URL downloads.
    /// Default: 3 retries.
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    /// Default: 100ms.
    pub retry_base_delay: Duration,

    /// Maximum backoff delay (cap for exponential growth).
    /// Default: 5 seconds.
    pub max_retry_delay: Duration,

    // ----------------------------
    // Storage
    // ----------------------------
    /// Directory holding completed audio files.
    pub cache_dir: PathBuf,

    /// Directory holding progressive stores and in-progress cache writes.
    /// Must differ from `cache_dir`.
    pub temp_dir: PathBuf,

    /// Upper bound on cached files; oldest are evicted first. `None` disables eviction.
    pub max_cached_entries: Option<usize>,

    // ----------------------------
    // Status classification
    // ----------------------------
    /// Server status codes reported as rate limits. The stream continues.
    pub rate_limit_status_codes: Vec<i64>,

    /// Server status codes that terminate the request.
    pub fatal_status_codes: Vec<i64>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        let base = std::env::temp_dir().join("tts-stream");
        Self {
            endpoint: "https://api.minimax.io/v1/t2a_v2".to_string(),
            api_key: String::new(),
            model: "speech-02-turbo".to_string(),
            voice_id: "male-qn-qingse".to_string(),
            speed: 1.0,
            vol: 1.0,
            pitch: 0,
            sample_rate: 32_000,
            bitrate: 128_000,
            channel: 1,
            format: AudioFormat::Mp3,

            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),

            cache_dir: base.join("cache"),
            temp_dir: base.join("tmp"),
            max_cached_entries: None,

            rate_limit_status_codes: vec![1002, 1039],
            fatal_status_codes: vec![1004, 2013, 2049],
        }
    }
}

impl fmt::Debug for TtsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("TtsSettings")
            // Request
            .field("endpoint", &self.endpoint)
            .field("api_key", &api_key)
            .field("model", &self.model)
            .field("voice_id", &self.voice_id)
            .field("speed", &self.speed)
            .field("vol", &self.vol)
            .field("pitch", &self.pitch)
            .field("sample_rate", &self.sample_rate)
            .field("bitrate", &self.bitrate)
            .field("channel", &self.channel)
            .field("format", &self.format)
            // HTTP
            .field("request_timeout", &self.request_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            // Storage
            .field("cache_dir", &self.cache_dir)
            .field("temp_dir", &self.temp_dir)
            .field("max_cached_entries", &self.max_cached_entries)
            // Status
            .field("rate_limit_status_codes", &self.rate_limit_status_codes)
            .field("fatal_status_codes", &self.fatal_status_codes)
            .finish()
    }
}

impl TtsSettings {
    // -------------------------
    // Constructors
    // -------------------------

    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tune for first-audio latency.
    /// - Shorter timeouts
    /// - Fewer retries
    /// - Faster backoff cadence
    pub fn low_latency(mut self) -> Self {
        self.request_timeout = Duration::from_secs(5);
        self.idle_timeout = Duration::from_secs(10);
        self.max_retries = 1;
        self.retry_base_delay = Duration::from_millis(50);
        self.max_retry_delay = Duration::from_millis(500);
        self
    }

    /// Apply `TTS_API_KEY`, `TTS_ENDPOINT`, `TTS_MODEL`, `TTS_VOICE_ID` and `TTS_CACHE_DIR`
    /// from the environment when they are set and non-empty.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = get("TTS_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("TTS_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = get("TTS_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("TTS_VOICE_ID") {
            self.voice_id = v;
        }
        if let Some(v) = get("TTS_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        debug!(settings = ?self, "settings: environment overrides applied");
        self
    }

    /// Request key for `text` under these settings.
    ///
    /// Includes every parameter that changes the produced audio, so the same text spoken by a
    /// different voice or in a different format is a different key.
    pub fn request_key(&self, text: &str) -> RequestKey {
        let speed = self.speed.to_string();
        let vol = self.vol.to_string();
        let pitch = self.pitch.to_string();
        let sample_rate = self.sample_rate.to_string();
        let bitrate = self.bitrate.to_string();
        let channel = self.channel.to_string();
        RequestKey::from_parts(&[
            text,
            &self.model,
            &self.voice_id,
            &speed,
            &vol,
            &pitch,
            &sample_rate,
            &bitrate,
            &channel,
            self.format.extension(),
        ])
    }

    // -------------------------
    // Request setters
    // -------------------------

    pub fn endpoint(mut self, v: impl Into<String>) -> Self {
        self.endpoint = v.into();
        self
    }

    pub fn api_key(mut self, v: impl Into<String>) -> Self {
        self.api_key = v.into();
        self
    }

    pub fn model(mut self, v: impl Into<String>) -> Self {
        self.model = v.into();
        self
    }

    pub fn voice_id(mut self, v: impl Into<String>) -> Self {
        self.voice_id = v.into();
        self
    }

    pub fn speed(mut self, v: f32) -> Self {
        self.speed = v;
        self
    }

    pub fn vol(mut self, v: f32) -> Self {
        self.vol = v;
        self
    }

    pub fn pitch(mut self, v: i32) -> Self {
        self.pitch = v;
        self
    }

    pub fn sample_rate(mut self, v: u32) -> Self {
        self.sample_rate = v;
        self
    }

    pub fn bitrate(mut self, v: u32) -> Self {
        self.bitrate = v;
        self
    }

    pub fn channel(mut self, v: u8) -> Self {
        self.channel = v;
        self
    }

    pub fn format(mut self, v: AudioFormat) -> Self {
        self.format = v;
        self
    }

    // -------------------------
    // HTTP setters
    // -------------------------

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn idle_timeout(mut self, v: Duration) -> Self {
        self.idle_timeout = v;
        self
    }

    pub fn max_retries(mut self, v: u32) -> Self {
        self.max_retries = v;
        self
    }

    pub fn retry_base_delay(mut self, v: Duration) -> Self {
        self.retry_base_delay = v;
        self
    }

    pub fn max_retry_delay(mut self, v: Duration) -> Self {
        self.max_retry_delay = v;
        self
    }

    // -------------------------
    // Storage setters
    // -------------------------

    pub fn cache_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.cache_dir = v.into();
        self
    }

    pub fn temp_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.temp_dir = v.into();
        self
    }

    pub fn max_cached_entries(mut self, v: Option<usize>) -> Self {
        self.max_cached_entries = v;
        self
    }

    // -------------------------
    // Status setters
    // -------------------------

    pub fn rate_limit_status_codes(mut self, v: Vec<i64>) -> Self {
        self.rate_limit_status_codes = v;
        self
    }

    pub fn fatal_status_codes(mut self, v: Vec<i64>) -> Self {
        self.fatal_status_codes = v;
        self
    }
}
