//! Session orchestration
//!
//! One control-plane task consumes the tagged event channel, runs every
//! event through the reducer, and executes the resulting effects. All
//! per-session resources - the capture handle, the live backend, the relay
//! and forwarder tasks - are owned here exclusively; producers only ever
//! send events.
//!
//! Nothing on the control path blocks: backend calls enqueue, timers are
//! spawned sleeps, and text delivery runs on its own thread because a sink
//! may legitimately take seconds (clipboard ownership).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioFrame, AudioInput, DebugCapture, FrameResampler, SessionWav};
use crate::backend::{BackendEvent, BackendKind, TranscriptionBackend};
use crate::credentials::CredentialProvider;
use crate::permissions::PermissionProvider;
use crate::sink::TextSink;
use crate::state_machine::{
    reduce, ControlEvent, Effect, SessionState, ERROR_DISPLAY_DELAY, SESSION_FALLBACK_TIMEOUT,
};

const CONTROL_QUEUE: usize = 64;
const FRAME_QUEUE: usize = 64;
const BACKEND_EVENT_QUEUE: usize = 64;

/// Per-session one-shot guard around TextSink delivery.
///
/// Both the backend's final result and the timeout fallback can try to
/// conclude a session; whichever checks-and-sets first is the only one that
/// dispatches.
pub struct DispatchRecord {
    fired: AtomicBool,
}

impl DispatchRecord {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Re-arm at session start.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }

    /// True only for the first caller since the last reset.
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }
}

impl Default for DispatchRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the backend instance for a new session. Exactly one instance is
/// live at a time; the orchestrator destroys it on session end or provider
/// switch before ever creating another.
pub trait BackendFactory: Send {
    fn create(&self, kind: BackendKind) -> Box<dyn TranscriptionBackend>;
}

/// Orchestrator-level timers. The session fallback is deliberately longer
/// than the backends' own finish timeout; it only fires when a backend is
/// wedged enough to miss its own fallback.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub session_fallback: Duration,
    pub error_clear: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            session_fallback: SESSION_FALLBACK_TIMEOUT,
            error_clear: ERROR_DISPLAY_DELAY,
        }
    }
}

/// Everything the orchestrator consumes, behind seams so tests can script
/// each collaborator.
pub struct Deps {
    pub capture: Box<dyn AudioInput>,
    pub factory: Box<dyn BackendFactory>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub sink: Arc<dyn TextSink>,
}

#[derive(Clone)]
pub struct Options {
    pub provider: BackendKind,
    pub auto_submit: bool,
    pub timeouts: Timeouts,
    pub debug_capture: Option<DebugCapture>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            provider: BackendKind::Remote,
            auto_submit: false,
            timeouts: Timeouts::default(),
            debug_capture: None,
        }
    }
}

/// Cloneable handle for producers and UI collaborators.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<ControlEvent>,
    preview: watch::Receiver<String>,
    state: watch::Receiver<SessionState>,
}

impl OrchestratorHandle {
    /// Sender for event producers (the combo monitor, integrations).
    pub fn sender(&self) -> mpsc::Sender<ControlEvent> {
        self.tx.clone()
    }

    pub async fn send(&self, event: ControlEvent) {
        if self.tx.send(event).await.is_err() {
            log::warn!("Control loop is gone; event dropped");
        }
    }

    /// Latest partial transcript, for preview surfaces.
    pub fn preview(&self) -> watch::Receiver<String> {
        self.preview.clone()
    }

    /// Session state, for status surfaces.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Resources of the one open session.
struct LiveSession {
    id: Uuid,
    backend: Option<Box<dyn TranscriptionBackend>>,
    relay: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

/// The control-plane state machine runner.
pub struct Orchestrator {
    capture: Box<dyn AudioInput>,
    factory: Box<dyn BackendFactory>,
    permissions: Arc<dyn PermissionProvider>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn TextSink>,

    provider: BackendKind,
    auto_submit: bool,
    timeouts: Timeouts,
    debug_capture: Option<DebugCapture>,

    record: DispatchRecord,
    state: SessionState,
    live: Option<LiveSession>,

    tx: mpsc::Sender<ControlEvent>,
    rx: mpsc::Receiver<ControlEvent>,
    preview_tx: watch::Sender<String>,
    state_tx: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(deps: Deps, options: Options) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        let (preview_tx, preview_rx) = watch::channel(String::new());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let handle = OrchestratorHandle {
            tx: tx.clone(),
            preview: preview_rx,
            state: state_rx,
        };

        let orchestrator = Self {
            capture: deps.capture,
            factory: deps.factory,
            permissions: deps.permissions,
            credentials: deps.credentials,
            sink: deps.sink,
            provider: options.provider,
            auto_submit: options.auto_submit,
            timeouts: options.timeouts,
            debug_capture: options.debug_capture,
            record: DispatchRecord::new(),
            state: SessionState::Idle,
            live: None,
            tx,
            rx,
            preview_tx,
            state_tx,
        };

        (orchestrator, handle)
    }

    /// Consume events until `Shutdown`.
    pub async fn run(mut self) {
        log::info!("Control loop started (provider {:?})", self.provider);

        while let Some(event) = self.rx.recv().await {
            if matches!(event, ControlEvent::Shutdown) {
                log::info!("Shutdown requested");
                self.teardown_session();
                break;
            }

            if let ControlEvent::SwitchProvider { kind } = &event {
                self.provider = *kind;
            }

            let event = self.apply_preflight(event);

            let before = std::mem::discriminant(&self.state);
            let (next, effects) = reduce(&self.state, event);
            if std::mem::discriminant(&next) != before {
                log::info!("State transition: {:?} -> {:?}", self.state, next);
            }
            self.state = next.clone();
            let _ = self.state_tx.send(next);

            for effect in effects {
                self.execute(effect);
            }
        }

        log::info!("Control loop ended");
    }

    /// Session-start gates run before the reducer ever sees the engage
    /// edge, so a refused session never touches the device or the backend.
    fn apply_preflight(&self, event: ControlEvent) -> ControlEvent {
        if !matches!(event, ControlEvent::ComboEngaged) {
            return event;
        }
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::Error { .. }
        ) {
            return event;
        }
        match preflight_gates(
            self.provider,
            self.permissions.as_ref(),
            self.credentials.as_ref(),
        ) {
            Ok(()) => event,
            Err(message) => {
                log::warn!("Session refused: {}", message);
                ControlEvent::PreflightFailed { message }
            }
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSession { id } => self.open_session(id),

            Effect::CloseCapture { .. } => {
                // Idempotent; the relay drains and exits once the frame
                // channel closes behind the stopped tap.
                self.capture.stop();
            }

            Effect::RelayAudio { id, samples } => {
                if let Some(live) = self.live.as_ref().filter(|l| l.id == id) {
                    if let Some(backend) = live.backend.as_ref() {
                        backend.append_audio(samples);
                    }
                }
            }

            Effect::FinishBackend { id } => {
                if let Some(live) = self.live.as_ref().filter(|l| l.id == id) {
                    if let Some(backend) = live.backend.as_ref() {
                        backend.finish();
                    }
                }
            }

            Effect::StopBackend { id } => self.stop_backend(id),

            Effect::ArmSessionTimeout { id } => {
                let tx = self.tx.clone();
                let after = self.timeouts.session_fallback;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ControlEvent::SessionTimeout { id }).await;
                });
            }

            Effect::ArmErrorClear { id } => {
                let tx = self.tx.clone();
                let after = self.timeouts.error_clear;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ControlEvent::ErrorCleared { id }).await;
                });
            }

            Effect::Dispatch { id, text } => self.dispatch(id, text),

            Effect::FallbackDispatch { id } => {
                let Some(live) = self.live.as_ref().filter(|l| l.id == id) else {
                    return;
                };
                let text = live
                    .backend
                    .as_ref()
                    .map(|b| b.current_text())
                    .unwrap_or_default();
                let text = text.trim().to_string();
                if text.is_empty() {
                    log::info!("Session {} timed out with no text", id);
                    return;
                }
                log::info!("Session {} timed out; dispatching latest known text", id);
                let _ = self.preview_tx.send(text.clone());
                self.dispatch(id, text);
            }

            Effect::UpdatePreview { text } => {
                let _ = self.preview_tx.send(text);
            }
        }
    }

    fn open_session(&mut self, id: Uuid) {
        self.record.reset();

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        if let Err(e) = self.capture.start(frame_tx) {
            // The backend is never started when the audio source fails
            self.post(ControlEvent::SessionOpenFailed {
                id,
                message: e.to_string(),
            });
            return;
        }

        let mut backend = self.factory.create(self.provider);
        let (event_tx, event_rx) = mpsc::channel(BACKEND_EVENT_QUEUE);
        if let Err(e) = backend.start(event_tx) {
            self.capture.stop();
            self.post(ControlEvent::SessionOpenFailed {
                id,
                message: e.to_string(),
            });
            return;
        }

        let wav = self.debug_capture.as_ref().and_then(|d| d.begin());
        let relay = tokio::spawn(run_relay(id, frame_rx, self.tx.clone(), wav));
        let forwarder = tokio::spawn(run_forwarder(id, event_rx, self.tx.clone()));

        log::info!("Session {} opened ({:?})", id, self.provider);
        self.live = Some(LiveSession {
            id,
            backend: Some(backend),
            relay: Some(relay),
            forwarder: Some(forwarder),
        });
    }

    fn stop_backend(&mut self, id: Uuid) {
        if self.live.as_ref().map(|l| l.id) != Some(id) {
            return;
        }
        if let Some(mut live) = self.live.take() {
            if let Some(backend) = live.backend.take() {
                backend.stop();
            }
            if let Some(forwarder) = live.forwarder.take() {
                forwarder.abort();
            }
            if let Some(relay) = live.relay.take() {
                relay.abort();
            }
            log::debug!("Session {} resources released", id);
        }
    }

    fn teardown_session(&mut self) {
        self.capture.stop();
        if let Some(id) = self.live.as_ref().map(|l| l.id) {
            self.stop_backend(id);
        }
    }

    fn dispatch(&self, id: Uuid, text: String) {
        if !self.record.fire() {
            log::debug!("Session {} already dispatched; result dropped", id);
            return;
        }
        let sink = Arc::clone(&self.sink);
        let auto_submit = self.auto_submit;
        // The sink may block for seconds; give it its own thread
        std::thread::spawn(move || match sink.dispatch(&text, auto_submit) {
            Ok(method) => log::info!("Session {} delivered via {:?}", id, method),
            Err(e) => log::error!("Session {} delivery failed: {}", id, e),
        });
    }

    /// Post an event from inside the control loop. Must never await: the
    /// loop is its own consumer, so a blocking send on a full channel would
    /// deadlock.
    fn post(&self, event: ControlEvent) {
        if self.tx.try_send(event).is_err() {
            log::error!("Control channel full; event dropped");
        }
    }
}

/// The session-start gates, in the order they are reported.
fn preflight_gates(
    provider: BackendKind,
    permissions: &dyn PermissionProvider,
    credentials: &dyn CredentialProvider,
) -> Result<(), String> {
    if !permissions.microphone_granted() {
        return Err("Microphone permission required".to_string());
    }
    match provider {
        BackendKind::Local => {
            if !permissions.speech_granted() {
                return Err("Speech recognition permission required".to_string());
            }
        }
        BackendKind::Remote => {
            if credentials.api_key().is_none() {
                return Err("No API key configured".to_string());
            }
        }
    }
    Ok(())
}

/// Receive raw frames, resample, and post fixed 20 ms chunks tagged with
/// the session id. Exits when the stopped tap closes the frame channel.
async fn run_relay(
    id: Uuid,
    mut frames: mpsc::Receiver<AudioFrame>,
    tx: mpsc::Sender<ControlEvent>,
    mut wav: Option<SessionWav>,
) {
    let mut resampler = FrameResampler::new();
    let mut ready: Vec<Vec<i16>> = Vec::new();

    while let Some(frame) = frames.recv().await {
        resampler.push(&frame, &mut |chunk| ready.push(chunk));
        for samples in ready.drain(..) {
            if let Some(wav) = wav.as_mut() {
                wav.write(&samples);
            }
            if tx
                .send(ControlEvent::AudioChunk { id, samples })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    resampler.finish(&mut |chunk| ready.push(chunk));
    for samples in ready.drain(..) {
        if let Some(wav) = wav.as_mut() {
            wav.write(&samples);
        }
        if tx
            .send(ControlEvent::AudioChunk { id, samples })
            .await
            .is_err()
        {
            break;
        }
    }

    if let Some(wav) = wav {
        wav.finish();
    }
    log::debug!("Audio relay for session {} exiting", id);
}

/// Tag backend results with the session id and feed them to the control
/// loop. Stale results are filtered there, not here.
async fn run_forwarder(
    id: Uuid,
    mut events: mpsc::Receiver<BackendEvent>,
    tx: mpsc::Sender<ControlEvent>,
) {
    while let Some(event) = events.recv().await {
        let event = match event {
            BackendEvent::Partial { seq, text } => ControlEvent::Partial { id, seq, text },
            BackendEvent::Final { seq, text } => ControlEvent::Final { id, seq, text },
            BackendEvent::Failure { error } => ControlEvent::BackendFailed {
                id,
                message: error.to_string(),
            },
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
