//! Transcription backends
//!
//! A backend takes a stream of 16 kHz mono i16 audio and produces partial and
//! final transcripts for one session. Two implementations exist: an on-device
//! recognizer (`LocalBackend`) and a WebSocket streaming client
//! (`RemoteBackend`). The orchestrator owns exactly one backend instance per
//! session and talks to it only through the `TranscriptionBackend` trait.

mod local;
mod pending;
mod protocol;
mod remote;
mod whisper;

pub use local::{EngineError, LocalBackend, SpeechEngine};
pub use pending::PendingAudioQueue;
pub use protocol::{ClientMessage, ServerMessage};
pub use remote::{RemoteBackend, RemoteConfig};
pub use whisper::WhisperEngine;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

/// How long a backend waits after `finish()` for its own final result before
/// falling back to the latest known text.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Which transcription provider to use for the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

/// Errors a backend can report.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Missing credential or engine/model; raised synchronously by `start()`
    Unavailable(String),
    /// Network or socket failure
    Transport(String),
    /// Provider-reported error (auth, quota, rate limit), carries the
    /// server's message
    Server(String),
    /// On-device recognizer failure
    Engine(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Unavailable(e) => write!(f, "Backend unavailable: {}", e),
            BackendError::Transport(e) => write!(f, "Transport error: {}", e),
            BackendError::Server(e) => write!(f, "Server error: {}", e),
            BackendError::Engine(e) => write!(f, "Recognizer error: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

/// Results delivered asynchronously by a backend during a session.
///
/// `seq` is a per-session stamp, strictly increasing in the order results
/// became known; consumers drop anything not newer than what they already
/// applied.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Partial { seq: u64, text: String },
    Final { seq: u64, text: String },
    Failure { error: BackendError },
}

/// Common contract for both transcription backends.
///
/// Every method is non-blocking at the call site: `start` only validates
/// preconditions and spawns the backend's internal tasks, `append_audio`
/// enqueues, `finish`/`stop` signal. All I/O and decoding happens on the
/// backend's own tasks.
pub trait TranscriptionBackend: Send {
    /// Begin a session. Events are delivered on `events` until `stop()`.
    /// Fails with `Unavailable` when the backend has no credential or engine.
    fn start(&mut self, events: mpsc::Sender<BackendEvent>) -> Result<(), BackendError>;

    /// Hand one resampled chunk to the backend. May buffer internally; never
    /// blocks.
    fn append_audio(&self, samples: Vec<i16>);

    /// Signal end-of-input. The backend eventually delivers exactly one
    /// `Final` - its own finish timeout guarantees that even when the
    /// underlying recognizer never answers.
    fn finish(&self);

    /// Hard cancel. Releases all resources; no callback is delivered after
    /// this returns. Idempotent.
    fn stop(&self);

    /// The latest known (partial or final) text, queryable at any time.
    fn current_text(&self) -> String;
}

/// Shared result plumbing used by both backends.
///
/// Centralizes the per-session invariants: sequence stamping, at most one
/// `Final`, and full absorption of anything produced after `stop()`.
pub(crate) struct EventSink {
    tx: mpsc::Sender<BackendEvent>,
    text: Mutex<String>,
    seq: AtomicU64,
    finalized: AtomicBool,
    stopping: AtomicBool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<BackendEvent>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            text: Mutex::new(String::new()),
            seq: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record and emit a partial result. No-op once stopped or finalized.
    pub fn partial(&self, text: String) {
        if self.is_stopping() || self.finalized.load(Ordering::SeqCst) {
            return;
        }
        *self.text.lock().unwrap() = text.clone();
        let seq = self.next_seq();
        if self.tx.try_send(BackendEvent::Partial { seq, text }).is_err() {
            log::debug!("Backend event channel full; partial dropped");
        }
    }

    /// Record and emit the final result. Returns false when a final was
    /// already delivered or the backend is stopping - the caller must then
    /// discard its result.
    pub fn finalize(&self, text: String) -> bool {
        if self.is_stopping() {
            return false;
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.text.lock().unwrap() = text.clone();
        let seq = self.next_seq();
        if let Err(e) = self.tx.try_send(BackendEvent::Final { seq, text }) {
            log::error!("Failed to deliver final transcript: {}", e);
        }
        true
    }

    /// Emit a failure. No-op once stopped or finalized.
    pub fn fail(&self, error: BackendError) {
        if self.is_stopping() || self.finalized.load(Ordering::SeqCst) {
            log::debug!("Discarding backend error after stop/final: {}", error);
            return;
        }
        if self.tx.try_send(BackendEvent::Failure { error }).is_err() {
            log::debug!("Backend event channel full; failure dropped");
        }
    }

    pub fn current_text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn has_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Flip the stopping flag. Returns true only for the first caller so
    /// teardown runs once.
    pub fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partials_carry_increasing_sequence_stamps() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx);

        sink.partial("he".to_string());
        sink.partial("hello".to_string());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (BackendEvent::Partial { seq: a, .. }, BackendEvent::Partial { seq: b, .. }) => {
                assert!(b > a);
            }
            other => panic!("expected two partials, got {:?}", other),
        }
        assert_eq!(sink.current_text(), "hello");
    }

    #[tokio::test]
    async fn only_first_finalize_wins() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx);

        assert!(sink.finalize("first".to_string()));
        assert!(!sink.finalize("second".to_string()));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Final { text, .. } if text == "first"));
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.current_text(), "first");
    }

    #[tokio::test]
    async fn everything_after_stop_is_absorbed() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx);

        assert!(sink.begin_stop());
        assert!(!sink.begin_stop());

        sink.partial("late".to_string());
        assert!(!sink.finalize("late final".to_string()));
        sink.fail(BackendError::Transport("closed by us".to_string()));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn backend_error_display() {
        let err = BackendError::Unavailable("no API key configured".to_string());
        assert!(err.to_string().contains("no API key"));

        let err = BackendError::Server("quota exceeded".to_string());
        assert!(err.to_string().contains("quota exceeded"));
    }
}
