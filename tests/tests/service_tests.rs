//! Speech service integration tests: ingestion and playback wired together against the local
//! synthesis fixture, with a recording player standing in for the audio engine.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tts_stream::{ChunkRegion, Completion, RequestKey, TtsResult, TtsSettings};
use tts_stream_audio::{
    EngineHandle, PlaybackListener, PlaybackSource, PlaybackState, Player, PollingReader,
    SpeechService,
};
use tts_stream_sse::IngestEvent;
use tts_stream_tests::{init_tracing, temp_root};

mod sse_fixture;

use sse_fixture::{Script, SseFixture, audio_frame};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Player that accepts every source and reports `started` right away.
#[derive(Default)]
struct RecordingPlayer {
    loads: Mutex<Vec<(PlaybackSource, EngineHandle)>>,
}

impl Player for RecordingPlayer {
    fn load(&self, source: PlaybackSource, handle: EngineHandle) -> TtsResult<()> {
        handle.started();
        self.loads.lock().push((source, handle));
        Ok(())
    }

    fn stop(&self) {}
}

impl RecordingPlayer {
    fn last(&self) -> (PlaybackSource, EngineHandle) {
        self.loads.lock().last().cloned().expect("nothing loaded")
    }

    fn load_count(&self) -> usize {
        self.loads.lock().len()
    }
}

#[derive(Default)]
struct Recorder {
    chunks: Mutex<Vec<(RequestKey, ChunkRegion)>>,
    states: Mutex<Vec<(RequestKey, PlaybackState)>>,
    player_errors: Mutex<Vec<String>>,
}

impl PlaybackListener for Recorder {
    fn on_receive_chunk(&self, key: &RequestKey, region: ChunkRegion) {
        self.chunks.lock().push((key.clone(), region));
    }

    fn on_playback_state_changed(&self, key: &RequestKey, state: PlaybackState) {
        self.states.lock().push((key.clone(), state));
    }

    fn on_player_error(&self, _key: &RequestKey, error: &str) {
        self.player_errors.lock().push(error.to_string());
    }
}

struct Harness {
    fixture: SseFixture,
    player: Arc<RecordingPlayer>,
    recorder: Arc<Recorder>,
    // Keeps the weak listener registration alive.
    _listener: Arc<dyn PlaybackListener>,
    service: SpeechService,
}

async fn harness(name: &str, fixture: SseFixture) -> Harness {
    init_tracing();
    let base = fixture.start().await;
    let root = temp_root(name);
    let settings = TtsSettings::new()
        .endpoint(format!("{base}{}", sse_fixture::SYNTH_PATH))
        .cache_dir(root.join("cache"))
        .temp_dir(root.join("tmp"))
        .request_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(5))
        .max_retries(0);

    let player = Arc::new(RecordingPlayer::default());
    let service = SpeechService::new(settings, player.clone()).expect("service");
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn PlaybackListener> = recorder.clone();
    assert!(service.add_listener(&listener));

    Harness {
        fixture,
        player,
        recorder,
        _listener: listener,
        service,
    }
}

async fn wait_done(rx: &mut broadcast::Receiver<IngestEvent>, key: &RequestKey) -> Completion {
    loop {
        let ev = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("event channel closed");
        if ev.key() != key {
            continue;
        }
        match ev {
            IngestEvent::Completed { completion, .. } => return completion,
            IngestEvent::Cancelled { .. } => return Completion::Cancelled,
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn speak_plays_live_store_then_cached_file() {
    let h = harness(
        "service-speak",
        SseFixture::new().script(
            "hello",
            Script::events(vec![audio_frame("aa", false), audio_frame("bb", true)])
                .with_delay(Duration::from_millis(50)),
        ),
    )
    .await;
    let mut rx = h.service.subscribe();

    let key = h.service.speak("hello").unwrap();
    assert!(h.service.feeder().is_playing(&key));

    let (source, handle) = h.player.last();
    assert_eq!(handle.key(), &key);
    let PlaybackSource::Progressive(store) = source else {
        panic!("expected a progressive source, got {source:?}");
    };

    let reader = PollingReader::new(store.open().unwrap(), Duration::from_millis(1));
    let played = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map(|_| out)
    });
    let played = timeout(EVENT_TIMEOUT, played)
        .await
        .expect("reader never reached the end")
        .unwrap()
        .unwrap();
    assert_eq!(played, vec![0xaa, 0xbb]);
    assert_eq!(wait_done(&mut rx, &key).await, Completion::Finished);

    handle.ended();
    assert_eq!(h.service.feeder().state(), PlaybackState::Idle);

    let again = h.service.speak("hello").unwrap();
    assert_eq!(again, key);
    match h.player.last().0 {
        PlaybackSource::File(path) => assert_eq!(std::fs::read(path).unwrap(), vec![0xbb]),
        other => panic!("expected the cached file, got {other:?}"),
    }
    assert_eq!(h.fixture.requests_for("hello"), 1);

    h.service.shutdown().await;
}

#[tokio::test]
async fn switching_keys_delivers_only_active_key_events() {
    let h = harness(
        "service-switch",
        SseFixture::new()
            .script(
                "first",
                Script::events(vec![audio_frame("01", false), audio_frame("02", false)])
                    .with_delay(Duration::from_millis(200))
                    .hanging(),
            )
            .script(
                "second",
                Script::events(vec![audio_frame("aa", false), audio_frame("bbcc", true)]),
            ),
    )
    .await;
    let mut rx = h.service.subscribe();

    let first = h.service.speak("first").unwrap();
    let second = h.service.speak("second").unwrap();
    assert!(!h.service.feeder().is_playing(&first));
    assert!(h.service.feeder().is_playing(&second));
    assert_eq!(wait_done(&mut rx, &second).await, Completion::Finished);

    // Let the first key produce audio while it is no longer active.
    loop {
        let ev = timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        if ev.key() == &first && matches!(ev, IngestEvent::ChunkReceived { .. }) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.feeder().flush().await;

    let chunks = h.recorder.chunks.lock().clone();
    assert_eq!(
        chunks.iter().map(|(k, r)| (k.clone(), r.len)).collect::<Vec<_>>(),
        vec![(second.clone(), 1), (second.clone(), 2)]
    );
    let states = h.recorder.states.lock().clone();
    assert_eq!(states.first(), Some(&(first.clone(), PlaybackState::Loading)));
    assert!(states.contains(&(first.clone(), PlaybackState::Idle)));
    assert!(states.contains(&(second.clone(), PlaybackState::Playing)));

    // The first request kept running after the switch.
    assert!(h.service.client().is_in_flight(&first));
    assert!(h.service.cancel(&first));
    assert_eq!(wait_done(&mut rx, &first).await, Completion::Cancelled);
    assert!(h.service.feeder().is_active(&second));

    h.service.shutdown().await;
}

#[tokio::test]
async fn player_error_discards_cached_file() {
    let h = harness(
        "service-player-error",
        SseFixture::new().script("hello", Script::events(vec![audio_frame("abcd", true)])),
    )
    .await;
    let mut rx = h.service.subscribe();

    let key = h.service.speak("hello").unwrap();
    assert_eq!(wait_done(&mut rx, &key).await, Completion::Finished);
    assert!(h.service.client().cache().lookup(&key).is_some());

    h.service.speak("hello").unwrap();
    let (source, handle) = h.player.last();
    let PlaybackSource::File(path) = source else {
        panic!("expected the cached file, got {source:?}");
    };
    handle.failed("decoder rejected the file");
    h.service.feeder().flush().await;

    assert!(!path.exists());
    assert!(h.service.client().cache().lookup(&key).is_none());
    assert_eq!(h.service.feeder().state(), PlaybackState::Idle);
    assert_eq!(
        h.recorder.player_errors.lock().clone(),
        vec!["decoder rejected the file".to_string()]
    );

    // The next attempt goes back to the network.
    h.service.speak("hello").unwrap();
    assert_eq!(wait_done(&mut rx, &key).await, Completion::Finished);
    assert_eq!(h.fixture.requests_for("hello"), 2);
    assert_eq!(h.player.load_count(), 3);

    h.service.shutdown().await;
}
