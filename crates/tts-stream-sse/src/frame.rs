//! Wire frames and their classification.
//!
//! Every event payload is a JSON object:
//!
//! ```json
//! {"trace_id":"...","base_resp":{"status_code":0,"status_msg":"success"},
//!  "data":{"audio":"<hex>","status":1},"url":null,"type":0}
//! ```
//!
//! [`StreamFrame::parse`] turns one payload into exactly one [`StreamFrame`]. A payload that is not
//! valid JSON becomes [`StreamFrame::TransportError`]; nothing is dropped silently.

use serde::Deserialize;
use tts_stream::TtsSettings;

/// `data.status` of the last chunk of a request.
const STATUS_FINAL: i64 = 2;
/// `type` of a frame carrying a precomputed resource URL.
const TYPE_PRECOMPUTED_URL: i64 = 1;

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    base_resp: Option<BaseResp>,
    #[serde(default)]
    data: Option<RawAudio>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BaseResp {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

#[derive(Debug, Deserialize)]
struct RawAudio {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    status: Option<i64>,
}

/// How non-zero `base_resp.status_code` values are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    pub rate_limit_codes: Vec<i64>,
    pub fatal_codes: Vec<i64>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::from_settings(&TtsSettings::default())
    }
}

impl StatusPolicy {
    pub fn from_settings(settings: &TtsSettings) -> Self {
        Self {
            rate_limit_codes: settings.rate_limit_status_codes.clone(),
            fatal_codes: settings.fatal_status_codes.clone(),
        }
    }

    fn classify(&self, code: i64, msg: String) -> StreamFrame {
        if self.rate_limit_codes.contains(&code) {
            StreamFrame::RateLimited { code, msg }
        } else {
            StreamFrame::ServerError {
                code,
                msg,
                terminal: self.fatal_codes.contains(&code),
            }
        }
    }
}

/// Audio carried by one frame, still hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub trace_id: Option<String>,
    pub hex: String,
    pub is_final: bool,
}

/// One classified server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// The server throttled the request. The stream may continue.
    RateLimited { code: i64, msg: String },
    /// Any other non-zero status. `terminal` frames end the request.
    ServerError {
        code: i64,
        msg: String,
        terminal: bool,
    },
    /// The payload could not be understood.
    TransportError { msg: String },
    /// The whole resource is available at `url`; no audio chunks follow.
    PrecomputedUrl {
        trace_id: Option<String>,
        url: String,
    },
    AudioChunk(AudioChunk),
}

impl StreamFrame {
    /// Classify one event payload. First match wins:
    /// precomputed URL, non-zero status, audio chunk.
    pub fn parse(payload: &str, policy: &StatusPolicy) -> StreamFrame {
        let raw: RawFrame = match serde_json::from_str(payload.trim()) {
            Ok(raw) => raw,
            Err(e) => {
                return StreamFrame::TransportError {
                    msg: format!("malformed frame: {e}"),
                };
            }
        };

        let url = raw.url.filter(|u| !u.is_empty());
        if raw.kind == Some(TYPE_PRECOMPUTED_URL) {
            return match url {
                Some(url) => StreamFrame::PrecomputedUrl {
                    trace_id: raw.trace_id,
                    url,
                },
                None => StreamFrame::TransportError {
                    msg: "precomputed-url frame without url".to_string(),
                },
            };
        }

        if let Some(resp) = raw.base_resp {
            if resp.status_code != 0 {
                return policy.classify(resp.status_code, resp.status_msg);
            }
        }

        let (hex, status) = match raw.data {
            Some(data) => (data.audio.unwrap_or_default(), data.status),
            None => (String::new(), None),
        };
        if hex.is_empty() {
            if let Some(url) = url {
                return StreamFrame::PrecomputedUrl {
                    trace_id: raw.trace_id,
                    url,
                };
            }
        }

        StreamFrame::AudioChunk(AudioChunk {
            trace_id: raw.trace_id,
            hex,
            is_final: status == Some(STATUS_FINAL),
        })
    }
}
