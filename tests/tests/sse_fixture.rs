#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::{Value, json};

/// Path of the synthesis endpoint served by the fixture.
pub const SYNTH_PATH: &str = "/v1/t2a_v2";

/// What the fixture answers for one request text.
#[derive(Clone, Debug)]
pub enum Script {
    /// A `text/event-stream` body.
    Events {
        events: Vec<String>,
        /// Delay before each event.
        delay: Duration,
        /// Written after the events without the terminating blank line.
        trailer: Option<String>,
        /// Keep the connection open after the last event.
        hang: bool,
    },
    /// A plain (non-streaming) response.
    Plain { status: StatusCode, body: String },
}

impl Script {
    pub fn events(events: Vec<String>) -> Self {
        Script::Events {
            events,
            delay: Duration::ZERO,
            trailer: None,
            hang: false,
        }
    }

    pub fn plain(status: StatusCode, body: impl Into<String>) -> Self {
        Script::Plain {
            status,
            body: body.into(),
        }
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        if let Script::Events { delay, .. } = &mut self {
            *delay = d;
        }
        self
    }

    pub fn with_trailer(mut self, t: impl Into<String>) -> Self {
        if let Script::Events { trailer, .. } = &mut self {
            *trailer = Some(t.into());
        }
        self
    }

    pub fn hanging(mut self) -> Self {
        if let Script::Events { hang, .. } = &mut self {
            *hang = true;
        }
        self
    }
}

/// Audio frame payload (`status` 2 marks the final chunk).
pub fn audio_frame(hex: &str, is_final: bool) -> String {
    json!({
        "trace_id": "trace-1",
        "base_resp": {"status_code": 0, "status_msg": "success"},
        "data": {"audio": hex, "status": if is_final { 2 } else { 1 }},
    })
    .to_string()
}

/// Non-success status payload.
pub fn status_frame(code: i64, msg: &str) -> String {
    json!({
        "trace_id": "trace-1",
        "base_resp": {"status_code": code, "status_msg": msg},
    })
    .to_string()
}

/// Precomputed-resource payload.
pub fn url_frame(url: &str) -> String {
    json!({
        "trace_id": "trace-1",
        "base_resp": {"status_code": 0, "status_msg": "success"},
        "type": 1,
        "url": url,
    })
    .to_string()
}

#[derive(Clone, Default)]
struct FixtureState {
    scripts: Arc<std::sync::Mutex<HashMap<String, Script>>>,
    blobs: Arc<std::sync::Mutex<HashMap<String, Bytes>>>,
    synth_requests: Arc<std::sync::Mutex<HashMap<String, u64>>>,
    total_synth_requests: Arc<AtomicU64>,
    last_auth: Arc<std::sync::Mutex<Option<String>>>,
}

/// In-memory synthesis server used by integration tests (no external network).
///
/// Paths:
/// - `POST /v1/t2a_v2`: answers with the [`Script`] registered for the request's `text`,
///   or 404.
/// - `GET /audio/{name}`: serves registered blobs (precomputed resources).
///
/// Request counters are tracked per text so tests can assert "no connection was opened".
/// Scripts and blobs may be registered before or after `start`.
#[derive(Clone, Default)]
pub struct SseFixture {
    state: FixtureState,
}

impl SseFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, text: &str, script: Script) -> Self {
        self.set_script(text, script);
        self
    }

    pub fn set_script(&self, text: &str, script: Script) {
        let mut lock = self.state.scripts.lock().unwrap();
        lock.insert(text.to_string(), script);
    }

    pub fn blob(self, name: &str, bytes: impl Into<Bytes>) -> Self {
        self.set_blob(name, bytes);
        self
    }

    pub fn set_blob(&self, name: &str, bytes: impl Into<Bytes>) {
        let mut lock = self.state.blobs.lock().unwrap();
        lock.insert(name.to_string(), bytes.into());
    }

    /// Start the fixture server and return its base URL (without a trailing `/`).
    pub async fn start(&self) -> String {
        let state = self.state.clone();
        let app = Router::new()
            .route(SYNTH_PATH, post(synthesize))
            .route("/audio/{name}", get(serve_blob))
            .with_state(state);

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind local fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener to tokio listener");
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    /// Number of synthesis requests received for `text`.
    pub fn requests_for(&self, text: &str) -> u64 {
        let lock = self.state.synth_requests.lock().unwrap();
        lock.get(text).copied().unwrap_or(0)
    }

    /// Number of synthesis requests received in total.
    pub fn total_requests(&self) -> u64 {
        self.state.total_synth_requests.load(Ordering::SeqCst)
    }

    /// `Authorization` header of the last synthesis request.
    pub fn last_auth(&self) -> Option<String> {
        self.state.last_auth.lock().unwrap().clone()
    }
}

async fn synthesize(
    State(state): State<FixtureState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let text = body["text"].as_str().unwrap_or_default().to_string();
    state.total_synth_requests.fetch_add(1, Ordering::SeqCst);
    *state.synth_requests.lock().unwrap().entry(text.clone()).or_insert(0) += 1;
    *state.last_auth.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let script = state.scripts.lock().unwrap().get(&text).cloned();
    let Some(script) = script else {
        return (StatusCode::NOT_FOUND, "no script").into_response();
    };

    match script {
        Script::Plain { status, body } => (status, body).into_response(),
        Script::Events {
            events,
            delay,
            trailer,
            hang,
        } => {
            let mut chunks: Vec<Bytes> = events
                .into_iter()
                .map(|e| Bytes::from(format!("data: {e}\n\n")))
                .collect();
            if let Some(t) = trailer {
                chunks.push(Bytes::from(format!("data: {t}")));
            }

            let body = stream::iter(chunks).then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, io::Error>(chunk)
            });
            let body = if hang {
                body.chain(stream::pending()).boxed()
            } else {
                body.boxed()
            };

            let mut response = Response::new(Body::from_stream(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            response
        }
    }
}

async fn serve_blob(State(state): State<FixtureState>, Path(name): Path<String>) -> Response {
    let blob = state.blobs.lock().unwrap().get(&name).cloned();
    match blob {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
