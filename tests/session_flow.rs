//! End-to-end session scenarios against the real control loop
//!
//! Every collaborator the orchestrator consumes is scripted: the audio input
//! replays canned frames, the backend is driven by the test, and the sink
//! records its calls. Only the orchestrator, reducer, relay and timers are
//! real.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use talkey::audio::{AudioError, AudioFrame, AudioInput, InputFormat};
use talkey::backend::{BackendError, BackendEvent, BackendKind, TranscriptionBackend};
use talkey::credentials::CredentialProvider;
use talkey::orchestrator::{
    BackendFactory, Deps, Options, Orchestrator, OrchestratorHandle, Timeouts,
};
use talkey::permissions::PermissionProvider;
use talkey::sink::{DispatchMethod, SinkError, TextSink};
use talkey::state_machine::{ControlEvent, SessionState};

/// Shortened orchestrator timers so the timeout scenarios run in
/// milliseconds.
const TEST_SESSION_FALLBACK: Duration = Duration::from_millis(200);
const TEST_ERROR_CLEAR: Duration = Duration::from_millis(100);

#[derive(Clone, Default)]
struct InputProbe {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

/// Audio input that replays canned frames once started.
struct ScriptedInput {
    probe: InputProbe,
    frames: Vec<AudioFrame>,
}

impl AudioInput for ScriptedInput {
    fn start(&mut self, frames_tx: mpsc::Sender<AudioFrame>) -> Result<InputFormat, AudioError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        let frames = self.frames.clone();
        tokio::spawn(async move {
            for frame in frames {
                if frames_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(InputFormat {
            sample_rate: 16_000,
            channels: 1,
        })
    }

    fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared view into the scripted backend: the test emits events and reads
/// what the orchestrator did with it.
#[derive(Clone, Default)]
struct BackendProbe {
    events: Arc<Mutex<Option<mpsc::Sender<BackendEvent>>>>,
    appended: Arc<Mutex<Vec<Vec<i16>>>>,
    current: Arc<Mutex<String>>,
    starts: Arc<AtomicUsize>,
    finishes: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl BackendProbe {
    async fn emit(&self, event: BackendEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn set_current(&self, text: &str) {
        *self.current.lock().unwrap() = text.to_string();
    }

    fn appended_chunks(&self) -> usize {
        self.appended.lock().unwrap().len()
    }
}

struct ScriptedBackend {
    probe: BackendProbe,
}

impl TranscriptionBackend for ScriptedBackend {
    fn start(&mut self, events: mpsc::Sender<BackendEvent>) -> Result<(), BackendError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        *self.probe.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn append_audio(&self, samples: Vec<i16>) {
        self.probe.appended.lock().unwrap().push(samples);
    }

    fn finish(&self) {
        self.probe.finishes.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn current_text(&self) -> String {
        self.probe.current.lock().unwrap().clone()
    }
}

struct ScriptedFactory {
    probe: BackendProbe,
    created: Arc<AtomicUsize>,
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, _kind: BackendKind) -> Box<dyn TranscriptionBackend> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedBackend {
            probe: self.probe.clone(),
        })
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    calls: Arc<Mutex<Vec<(String, bool)>>>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TextSink for RecordingSink {
    fn dispatch(&self, text: &str, auto_submit: bool) -> Result<DispatchMethod, SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), auto_submit));
        Ok(DispatchMethod::Clipboard)
    }
}

struct Grants {
    microphone: bool,
    speech: bool,
}

impl PermissionProvider for Grants {
    fn microphone_granted(&self) -> bool {
        self.microphone
    }
    fn speech_granted(&self) -> bool {
        self.speech
    }
    fn accessibility_granted(&self) -> bool {
        true
    }
}

struct Keys(Option<String>);

impl CredentialProvider for Keys {
    fn api_key(&self) -> Option<String> {
        self.0.clone()
    }
}

struct HarnessConfig {
    microphone: bool,
    api_key: Option<String>,
    frames: Vec<AudioFrame>,
    auto_submit: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            microphone: true,
            api_key: Some("test-key".to_string()),
            frames: Vec::new(),
            auto_submit: false,
        }
    }
}

struct Harness {
    handle: OrchestratorHandle,
    input: InputProbe,
    backend: BackendProbe,
    sink: RecordingSink,
    created: Arc<AtomicUsize>,
}

fn spawn_harness(config: HarnessConfig) -> Harness {
    let input = InputProbe::default();
    let backend = BackendProbe::default();
    let sink = RecordingSink::default();
    let created = Arc::new(AtomicUsize::new(0));

    let deps = Deps {
        capture: Box::new(ScriptedInput {
            probe: input.clone(),
            frames: config.frames,
        }),
        factory: Box::new(ScriptedFactory {
            probe: backend.clone(),
            created: Arc::clone(&created),
        }),
        permissions: Arc::new(Grants {
            microphone: config.microphone,
            speech: true,
        }),
        credentials: Arc::new(Keys(config.api_key)),
        sink: Arc::new(sink.clone()),
    };

    let options = Options {
        provider: BackendKind::Remote,
        auto_submit: config.auto_submit,
        timeouts: Timeouts {
            session_fallback: TEST_SESSION_FALLBACK,
            error_clear: TEST_ERROR_CLEAR,
        },
        debug_capture: None,
    };

    let (orchestrator, handle) = Orchestrator::new(deps, options);
    tokio::spawn(orchestrator.run());

    Harness {
        handle,
        input,
        backend,
        sink,
        created,
    }
}

fn tone_frame() -> AudioFrame {
    AudioFrame {
        samples: vec![0.25; 320],
        sample_rate: 16_000,
        channels: 1,
    }
}

async fn wait_for_state(
    handle: &OrchestratorHandle,
    what: &str,
    pred: impl Fn(&SessionState) -> bool,
) {
    let mut rx = handle.state();
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("control loop ended while waiting for {}", what);
            }
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn eventually(what: &str, pred: impl Fn() -> bool) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn press_speak_release_dispatches_exactly_once() {
    let h = spawn_harness(HarnessConfig {
        frames: vec![tone_frame(), tone_frame()],
        auto_submit: true,
        ..HarnessConfig::default()
    });

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;

    // Captured audio reaches the backend through the relay
    let backend = h.backend.clone();
    eventually("audio to reach the backend", move || {
        backend.appended_chunks() >= 2
    })
    .await;

    h.backend
        .emit(BackendEvent::Partial {
            seq: 1,
            text: "hel".to_string(),
        })
        .await;
    h.backend
        .emit(BackendEvent::Partial {
            seq: 2,
            text: "hello".to_string(),
        })
        .await;

    // Partials update the preview surface, never the sink
    let preview = h.handle.preview();
    eventually("preview to show the partial", move || {
        *preview.borrow() == "hello"
    })
    .await;
    assert!(h.sink.calls().is_empty());

    h.handle.send(ControlEvent::ComboReleased).await;
    wait_for_state(&h.handle, "Processing", |s| {
        matches!(s, SessionState::Processing { .. })
    })
    .await;

    let finishes = Arc::clone(&h.backend.finishes);
    eventually("finish to be signalled", move || {
        finishes.load(Ordering::SeqCst) == 1
    })
    .await;

    h.backend
        .emit(BackendEvent::Final {
            seq: 3,
            text: "hello".to_string(),
        })
        .await;
    wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;

    let sink = h.sink.clone();
    eventually("the dispatch", move || sink.calls().len() == 1).await;
    assert_eq!(h.sink.calls(), vec![("hello".to_string(), true)]);

    let stops = Arc::clone(&h.backend.stops);
    eventually("the backend to be released", move || {
        stops.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(h.input.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_fallback_dispatches_once_and_discards_the_late_final() {
    let h = spawn_harness(HarnessConfig::default());

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;

    h.backend.set_current("deadline text");
    h.handle.send(ControlEvent::ComboReleased).await;
    wait_for_state(&h.handle, "Processing", |s| {
        matches!(s, SessionState::Processing { .. })
    })
    .await;

    // Nothing is dispatched before the fallback deadline
    tokio::time::sleep(TEST_SESSION_FALLBACK / 4).await;
    assert!(h.sink.calls().is_empty());

    // The backend never answers; the session timeout concludes the session
    // with the text known at that moment
    wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;
    let sink = h.sink.clone();
    eventually("the fallback dispatch", move || sink.calls().len() == 1).await;
    assert_eq!(h.sink.calls()[0].0, "deadline text");

    // The real final arriving later must be discarded, not dispatched
    h.backend
        .emit(BackendEvent::Final {
            seq: 5,
            text: "too late".to_string(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.sink.calls().len(), 1);
}

#[tokio::test]
async fn empty_final_completes_the_session_without_dispatch() {
    let h = spawn_harness(HarnessConfig::default());

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;
    h.handle.send(ControlEvent::ComboReleased).await;

    h.backend
        .emit(BackendEvent::Final {
            seq: 1,
            text: String::new(),
        })
        .await;
    wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sink.calls().is_empty());
    let stops = Arc::clone(&h.backend.stops);
    eventually("the backend to be released", move || {
        stops.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn denied_microphone_reports_error_and_recovers_to_idle() {
    let h = spawn_harness(HarnessConfig {
        microphone: false,
        ..HarnessConfig::default()
    });

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "the permission error", |s| {
        matches!(s, SessionState::Error { message, .. }
            if message == "Microphone permission required")
    })
    .await;

    // Neither the audio source nor the backend was ever started
    assert_eq!(h.input.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.created.load(Ordering::SeqCst), 0);

    // The error display auto-clears
    wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;
    assert!(h.sink.calls().is_empty());
}

#[tokio::test]
async fn double_engage_never_opens_a_second_session() {
    let h = spawn_harness(HarnessConfig::default());

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;

    h.handle.send(ControlEvent::ComboEngaged).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.input.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provider_switch_mid_session_stops_the_old_backend_first() {
    let h = spawn_harness(HarnessConfig::default());

    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;

    h.handle
        .send(ControlEvent::SwitchProvider {
            kind: BackendKind::Local,
        })
        .await;
    wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;

    let stops = Arc::clone(&h.backend.stops);
    eventually("the old backend to be stopped", move || {
        stops.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(h.input.stops.load(Ordering::SeqCst), 1);
    assert!(h.sink.calls().is_empty());

    // The next session opens cleanly on the new provider
    h.handle.send(ControlEvent::ComboEngaged).await;
    wait_for_state(&h.handle, "Recording again", |s| {
        matches!(s, SessionState::Recording { .. })
    })
    .await;
    assert_eq!(h.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn consecutive_sessions_pass_through_idle() {
    let h = spawn_harness(HarnessConfig::default());

    for round in 1..=2 {
        h.handle.send(ControlEvent::ComboEngaged).await;
        wait_for_state(&h.handle, "Recording", |s| {
            matches!(s, SessionState::Recording { .. })
        })
        .await;

        h.handle.send(ControlEvent::ComboReleased).await;
        h.backend
            .emit(BackendEvent::Final {
                seq: 1,
                text: format!("round {}", round),
            })
            .await;
        wait_for_state(&h.handle, "Idle", |s| matches!(s, SessionState::Idle)).await;
    }

    let sink = h.sink.clone();
    eventually("both dispatches", move || sink.calls().len() == 2).await;
    assert_eq!(h.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.calls()[0].0, "round 1");
    assert_eq!(h.sink.calls()[1].0, "round 2");
}
