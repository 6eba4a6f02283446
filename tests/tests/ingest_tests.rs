//! Ingestion integration tests.
//!
//! All tests run the real client against a local in-memory synthesis fixture (no external
//! network) and observe it through the event channel, the live store and the cache directory.

use std::io::Read;
use std::time::Duration;

use axum::http::StatusCode;
use rstest::rstest;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

use tts_stream::{AudioFormat, Completion, RequestKey, TtsSettings};
use tts_stream_sse::{IngestEvent, StartOutcome, StreamIngestClient};
use tts_stream_tests::{init_tracing, temp_root};

mod sse_fixture;

use sse_fixture::{Script, SseFixture, audio_frame, status_frame, url_frame};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn settings(name: &str, base: &str) -> TtsSettings {
    let root = temp_root(name);
    TtsSettings::new()
        .endpoint(format!("{base}{}", sse_fixture::SYNTH_PATH))
        .api_key("test-key")
        .cache_dir(root.join("cache"))
        .temp_dir(root.join("tmp"))
        .request_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(5))
        .max_retries(0)
}

async fn client_for(name: &str, fixture: &SseFixture) -> StreamIngestClient {
    init_tracing();
    let base = fixture.start().await;
    StreamIngestClient::new(settings(name, &base)).expect("client")
}

async fn next_event(rx: &mut broadcast::Receiver<IngestEvent>) -> IngestEvent {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an ingest event")
        .expect("event channel closed")
}

/// Events of `key` up to and including its `Completed` / `Cancelled` event.
async fn events_until_done(
    rx: &mut broadcast::Receiver<IngestEvent>,
    key: &RequestKey,
) -> Vec<IngestEvent> {
    let mut out = Vec::new();
    loop {
        let ev = next_event(rx).await;
        if ev.key() != key {
            continue;
        }
        let done = matches!(
            ev,
            IngestEvent::Completed { .. } | IngestEvent::Cancelled { .. }
        );
        out.push(ev);
        if done {
            return out;
        }
    }
}

fn completion_of(events: &[IngestEvent]) -> Option<Completion> {
    events.iter().find_map(|ev| match ev {
        IngestEvent::Completed { completion, .. } => Some(*completion),
        IngestEvent::Cancelled { .. } => Some(Completion::Cancelled),
        _ => None,
    })
}

fn read_store_to_end(events: &[IngestEvent]) -> Vec<u8> {
    let store = events
        .iter()
        .find_map(|ev| match ev {
            IngestEvent::ChunkReceived { store, .. } => Some(store.clone()),
            _ => None,
        })
        .expect("no chunk was received");
    assert!(store.is_complete());
    let mut reader = store.open().expect("open store");
    let mut out = Vec::new();
    reader.read_to_end(&mut out).expect("read store");
    out
}

#[tokio::test]
async fn chunks_fill_store_and_final_chunk_is_cached() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![
            audio_frame("abcd", false),
            audio_frame("", false),
            audio_frame("ef01", true),
        ]),
    );
    let client = client_for("chunks", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    assert_eq!(client.start(key.clone(), "hello"), StartOutcome::Started);
    let events = events_until_done(&mut rx, &key).await;

    let regions: Vec<(u64, u64, bool)> = events
        .iter()
        .filter_map(|ev| match ev {
            IngestEvent::ChunkReceived {
                region, is_final, ..
            } => Some((region.offset, region.len, *is_final)),
            _ => None,
        })
        .collect();
    assert_eq!(regions, vec![(0, 2, false), (2, 2, true)]);
    assert_eq!(read_store_to_end(&events), vec![0xab, 0xcd, 0xef, 0x01]);

    let Some(IngestEvent::Completed {
        completion, entry, ..
    }) = events.last()
    else {
        panic!("expected Completed, got {:?}", events.last());
    };
    assert_eq!(*completion, Completion::Finished);
    let entry = entry.clone().expect("cache entry");
    assert_eq!(entry.format, AudioFormat::Mp3);
    assert_eq!(std::fs::read(&entry.path).unwrap(), vec![0xef, 0x01]);

    assert!(!client.is_in_flight(&key));
    assert_eq!(client.cache().lookup(&key).map(|e| e.path), Some(entry.path));
    assert_eq!(fixture.last_auth().as_deref(), Some("Bearer test-key"));
}

#[tokio::test]
async fn cached_key_opens_no_connection() {
    let fixture = SseFixture::new();
    let client = client_for("cache-hit", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    let entry = client
        .cache()
        .persist(&key, AudioFormat::Mp3, b"cached")
        .unwrap();

    assert_eq!(
        client.start(key.clone(), "hello"),
        StartOutcome::CacheHit(entry.clone())
    );
    match next_event(&mut rx).await {
        IngestEvent::ExistingCache { key: k, entry: e } => {
            assert_eq!(k, key);
            assert_eq!(e, entry);
        }
        other => panic!("expected ExistingCache, got {other:?}"),
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(fixture.total_requests(), 0);
    assert_eq!(client.registry().cache_hits(), 1);
    assert!(!client.is_in_flight(&key));
}

#[tokio::test]
async fn precomputed_url_is_downloaded_into_cache() {
    let fixture = SseFixture::new().blob("clip.mp3", &b"precomputed-audio"[..]);
    let client = client_for("precomputed", &fixture).await;
    let base = client
        .settings()
        .endpoint
        .trim_end_matches(sse_fixture::SYNTH_PATH)
        .to_string();
    let url = format!("{base}/audio/clip.mp3");
    fixture.set_script("hello", Script::events(vec![url_frame(&url)]).hanging());

    let mut rx = client.subscribe();
    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    match &events[0] {
        IngestEvent::ReceivedUrl { url: u, entry, .. } => {
            assert_eq!(u, &url);
            assert_eq!(std::fs::read(&entry.path).unwrap(), b"precomputed-audio");
        }
        other => panic!("expected ReceivedUrl, got {other:?}"),
    }
    assert_eq!(completion_of(&events), Some(Completion::Finished));
    assert!(client.cache().lookup(&key).is_some());
    assert!(!client.is_in_flight(&key));
}

#[tokio::test]
async fn rate_limit_is_reported_and_stream_continues() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![
            status_frame(1002, "rate limited"),
            audio_frame("aabb", true),
        ]),
    );
    let client = client_for("rate-limit", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert!(matches!(
        &events[0],
        IngestEvent::RateLimited { code: 1002, msg, .. } if msg == "rate limited"
    ));
    assert!(matches!(
        &events[1],
        IngestEvent::ChunkReceived { is_final: true, .. }
    ));
    assert_eq!(completion_of(&events), Some(Completion::Finished));
}

#[rstest]
#[case(1004, true)]
#[case(1001, false)]
#[tokio::test]
async fn server_status_codes_follow_policy(#[case] code: i64, #[case] terminal: bool) {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![status_frame(code, "server says no"), audio_frame("aa", true)]),
    );
    let client = client_for(&format!("server-status-{code}"), &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert!(matches!(
        &events[0],
        IngestEvent::ServerError { code: c, terminal: t, .. } if *c == code && *t == terminal
    ));
    if terminal {
        assert_eq!(events.len(), 2, "nothing after a terminal status: {events:?}");
        assert_eq!(completion_of(&events), Some(Completion::Failed));
        assert!(client.cache().lookup(&key).is_none());
    } else {
        assert_eq!(completion_of(&events), Some(Completion::Finished));
        assert!(client.cache().lookup(&key).is_some());
    }
    assert!(!client.is_in_flight(&key));
}

#[tokio::test]
async fn cancel_tears_down_request_without_caching() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![audio_frame("aa", false)]).hanging(),
    );
    let client = client_for("cancel", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");

    let store = match next_event(&mut rx).await {
        IngestEvent::ChunkReceived { store, .. } => store,
        other => panic!("expected ChunkReceived, got {other:?}"),
    };
    assert!(client.is_in_flight(&key));
    assert!(client.cancel(&key));
    assert!(!client.is_in_flight(&key));

    let events = events_until_done(&mut rx, &key).await;
    assert!(matches!(events.last(), Some(IngestEvent::Cancelled { .. })));
    assert_eq!(store.completion(), Some(Completion::Cancelled));
    assert!(client.cache().lookup(&key).is_none());
    assert!(!client.cancel(&key), "second cancel is a no-op");
}

#[tokio::test]
async fn cancel_during_final_chunk_persist_discards_artifact() {
    // Large enough that the cache write is still running when the test cancels.
    let final_hex = "ab".repeat(1 << 20);
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![audio_frame("01", false), audio_frame(&final_hex, true)]),
    );
    let client = client_for("cancel-final", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");

    let store = loop {
        match next_event(&mut rx).await {
            IngestEvent::ChunkReceived {
                is_final: true,
                store,
                ..
            } => break store,
            IngestEvent::ChunkReceived { .. } => continue,
            other => panic!("expected ChunkReceived, got {other:?}"),
        }
    };
    assert!(client.cancel(&key));

    let events = events_until_done(&mut rx, &key).await;
    assert!(
        matches!(events.as_slice(), [IngestEvent::Cancelled { .. }]),
        "{events:?}"
    );
    assert_eq!(store.completion(), Some(Completion::Cancelled));
    assert!(client.cache().lookup(&key).is_none());

    let leftovers: Vec<_> = std::fs::read_dir(client.cache().temp_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "download"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn unterminated_trailing_event_is_processed() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![audio_frame("aa", false)]).with_trailer(audio_frame("bb", true)),
    );
    let client = client_for("trailer", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert_eq!(completion_of(&events), Some(Completion::Finished));
    assert_eq!(read_store_to_end(&events), vec![0xaa, 0xbb]);
    let entry = client.cache().lookup(&key).expect("cache entry");
    assert_eq!(std::fs::read(entry.path).unwrap(), vec![0xbb]);
}

#[tokio::test]
async fn concurrent_start_opens_one_connection() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec![audio_frame("aa", false)])
            .with_delay(Duration::from_millis(20))
            .hanging(),
    );
    let client = client_for("dedupe", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    assert_eq!(client.start(key.clone(), "hello"), StartOutcome::Started);
    assert_eq!(
        client.start(key.clone(), "hello"),
        StartOutcome::AlreadyInFlight
    );

    // Once the first chunk arrived the connection is certainly open.
    assert!(matches!(
        next_event(&mut rx).await,
        IngestEvent::ChunkReceived { .. }
    ));
    assert_eq!(
        client.start(key.clone(), "hello"),
        StartOutcome::AlreadyInFlight
    );
    assert_eq!(fixture.requests_for("hello"), 1);

    client.cancel(&key);
    events_until_done(&mut rx, &key).await;
    assert_eq!(fixture.requests_for("hello"), 1);
}

#[tokio::test]
async fn stream_closed_before_final_chunk_fails() {
    let fixture = SseFixture::new().script("hello", Script::events(vec![audio_frame("aa", false)]));
    let client = client_for("closed", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, IngestEvent::NetError { .. }))
    );
    assert_eq!(completion_of(&events), Some(Completion::Failed));
    assert!(client.cache().lookup(&key).is_none());
    assert!(!client.is_in_flight(&key));
}

#[tokio::test]
async fn malformed_frame_is_reported_and_skipped() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::events(vec!["not json".to_string(), audio_frame("aa", true)]),
    );
    let client = client_for("malformed", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert!(matches!(&events[0], IngestEvent::NetError { .. }));
    assert_eq!(completion_of(&events), Some(Completion::Finished));
}

#[tokio::test]
async fn rejected_request_with_status_body_is_classified() {
    let fixture = SseFixture::new().script(
        "hello",
        Script::plain(StatusCode::UNAUTHORIZED, status_frame(1004, "invalid api key")),
    );
    let client = client_for("rejected", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    assert!(matches!(
        &events[0],
        IngestEvent::ServerError { code: 1004, terminal: true, .. }
    ));
    assert_eq!(events.len(), 2, "{events:?}");
    assert_eq!(completion_of(&events), Some(Completion::Failed));
    assert!(!client.is_in_flight(&key));
}

#[tokio::test]
async fn rejected_request_without_body_is_a_net_error() {
    let fixture = SseFixture::new().script("hello", Script::plain(StatusCode::INTERNAL_SERVER_ERROR, ""));
    let client = client_for("http-500", &fixture).await;
    let mut rx = client.subscribe();

    let key = client.request_key("hello");
    client.start(key.clone(), "hello");
    let events = events_until_done(&mut rx, &key).await;

    match &events[0] {
        IngestEvent::NetError { error, .. } => assert!(error.contains("500"), "{error}"),
        other => panic!("expected NetError, got {other:?}"),
    }
    assert_eq!(completion_of(&events), Some(Completion::Failed));

    // The key is free again: a retry opens a new connection.
    client.start(key.clone(), "hello");
    events_until_done(&mut rx, &key).await;
    assert_eq!(fixture.requests_for("hello"), 2);
}
