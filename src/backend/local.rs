//! On-device transcription backend
//!
//! Wraps a blocking speech engine behind the streaming backend contract.
//! A worker task accumulates the session's audio and re-decodes the whole
//! buffer once per second of new material, so the preview updates while the
//! user is still talking; `finish()` runs one last decode over everything,
//! with the usual 2 second fallback to the latest known text.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BackendError, BackendEvent, EventSink, TranscriptionBackend, FINISH_TIMEOUT};

/// New audio required before the buffer is re-decoded for a partial
/// (1 second at 16 kHz).
const PARTIAL_DECODE_STRIDE: usize = 16_000;

const WORKER_QUEUE: usize = 512;

/// Errors from the underlying recognizer engine.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// No model loaded / engine not initialized
    NotReady,
    /// The engine was cancelled mid-decode; the user simply stopped
    Cancelled,
    /// Decoding failed
    Decode(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotReady => write!(f, "Speech engine not ready"),
            EngineError::Cancelled => write!(f, "Decode cancelled"),
            EngineError::Decode(e) => write!(f, "Decode failed: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Seam between the backend and the actual recognizer.
///
/// `transcribe` is blocking and CPU-bound; the backend always calls it from a
/// blocking task. Implementations must tolerate being called with the same
/// leading audio repeatedly (the partial loop re-decodes the growing buffer).
pub trait SpeechEngine: Send + Sync {
    fn is_ready(&self) -> bool;
    fn transcribe(&self, samples: &[i16]) -> Result<String, EngineError>;
}

enum LocalCmd {
    Chunk(Vec<i16>),
    Finish,
}

/// On-device backend over a `SpeechEngine`.
pub struct LocalBackend {
    engine: Arc<dyn SpeechEngine>,
    finish_timeout: Duration,
    sink: Option<Arc<EventSink>>,
    cmd_tx: Option<mpsc::Sender<LocalCmd>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new(engine: Arc<dyn SpeechEngine>) -> Self {
        Self {
            engine,
            finish_timeout: FINISH_TIMEOUT,
            sink: None,
            cmd_tx: None,
            worker: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }
}

impl TranscriptionBackend for LocalBackend {
    fn start(&mut self, events: mpsc::Sender<BackendEvent>) -> Result<(), BackendError> {
        if !self.engine.is_ready() {
            return Err(BackendError::Unavailable(
                "speech model not loaded".to_string(),
            ));
        }

        let sink = EventSink::new(events);
        let (cmd_tx, cmd_rx) = mpsc::channel(WORKER_QUEUE);

        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.engine),
            cmd_rx,
            Arc::clone(&sink),
        ));

        self.sink = Some(sink);
        self.cmd_tx = Some(cmd_tx);
        *self.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    fn append_audio(&self, samples: Vec<i16>) {
        if let Some(tx) = &self.cmd_tx {
            if tx.try_send(LocalCmd::Chunk(samples)).is_err() {
                log::debug!("Local worker queue full or closed; chunk dropped");
            }
        }
    }

    fn finish(&self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if let Some(tx) = &self.cmd_tx {
            if tx.try_send(LocalCmd::Finish).is_err() {
                log::warn!("Local worker gone before finish");
            }
        }

        // Backend-internal fallback: a decode that outlives the window loses
        // to the latest known text.
        let timeout = self.finish_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if sink.has_finalized() || sink.is_stopping() {
                return;
            }
            let text = sink.current_text();
            log::info!(
                "Final decode timed out after {:?}; using latest partial ({} chars)",
                timeout,
                text.len()
            );
            sink.finalize(text);
        });
    }

    fn stop(&self) {
        let Some(sink) = &self.sink else {
            return;
        };
        if !sink.begin_stop() {
            return;
        }
        log::debug!("Stopping local backend");
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    fn current_text(&self) -> String {
        self.sink
            .as_ref()
            .map(|s| s.current_text())
            .unwrap_or_default()
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    engine: Arc<dyn SpeechEngine>,
    mut cmd_rx: mpsc::Receiver<LocalCmd>,
    sink: Arc<EventSink>,
) {
    let mut buffer: Vec<i16> = Vec::new();
    let mut decoded_len = 0usize;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            LocalCmd::Chunk(samples) => {
                buffer.extend_from_slice(&samples);
                if buffer.len() - decoded_len < PARTIAL_DECODE_STRIDE {
                    continue;
                }
                decoded_len = buffer.len();

                let engine = Arc::clone(&engine);
                let samples = buffer.clone();
                let result =
                    tokio::task::spawn_blocking(move || engine.transcribe(&samples)).await;
                match result {
                    Ok(Ok(text)) => {
                        if !text.trim().is_empty() {
                            sink.partial(text);
                        }
                    }
                    Ok(Err(EngineError::Cancelled)) => {}
                    Ok(Err(e)) => {
                        sink.fail(BackendError::Engine(e.to_string()));
                        return;
                    }
                    Err(e) => {
                        sink.fail(BackendError::Engine(format!(
                            "decode task failed: {}",
                            e
                        )));
                        return;
                    }
                }
            }
            LocalCmd::Finish => {
                log::debug!(
                    "Final decode over {} samples ({} chunks pending stride)",
                    buffer.len(),
                    buffer.len().saturating_sub(decoded_len)
                );
                let engine = Arc::clone(&engine);
                let samples = std::mem::take(&mut buffer);
                let result =
                    tokio::task::spawn_blocking(move || engine.transcribe(&samples)).await;
                match result {
                    Ok(Ok(text)) => {
                        sink.finalize(text);
                    }
                    Ok(Err(EngineError::Cancelled)) => {
                        // The user stopped the engine mid-decode; not an error
                        sink.finalize(sink.current_text());
                    }
                    Ok(Err(e)) => {
                        sink.fail(BackendError::Engine(e.to_string()));
                    }
                    Err(e) => {
                        sink.fail(BackendError::Engine(format!(
                            "decode task failed: {}",
                            e
                        )));
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Engine returning a scripted sequence of results.
    struct ScriptedEngine {
        ready: bool,
        responses: Mutex<VecDeque<Result<String, EngineError>>>,
    }

    impl ScriptedEngine {
        fn new(responses: Vec<Result<String, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                ready: true,
                responses: Mutex::new(responses.into()),
            })
        }

        fn not_ready() -> Arc<Self> {
            Arc::new(Self {
                ready: false,
                responses: Mutex::new(VecDeque::new()),
            })
        }
    }

    impl SpeechEngine for ScriptedEngine {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn transcribe(&self, _samples: &[i16]) -> Result<String, EngineError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    #[tokio::test]
    async fn start_without_model_is_unavailable() {
        let mut backend = LocalBackend::new(ScriptedEngine::not_ready());
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            backend.start(tx),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn one_second_of_audio_produces_a_partial() {
        let engine = ScriptedEngine::new(vec![Ok("hello".to_string())]);
        let mut backend = LocalBackend::new(engine);
        let (tx, mut rx) = mpsc::channel(8);
        backend.start(tx).unwrap();

        for _ in 0..50 {
            backend.append_audio(vec![0i16; 320]);
        }

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Partial { text, .. } if text == "hello"));
        assert_eq!(backend.current_text(), "hello");
    }

    #[tokio::test]
    async fn finish_delivers_exactly_one_final() {
        let engine = ScriptedEngine::new(vec![Ok("hello world".to_string())]);
        let mut backend = LocalBackend::new(engine);
        let (tx, mut rx) = mpsc::channel(8);
        backend.start(tx).unwrap();

        backend.append_audio(vec![0i16; 320]);
        backend.finish();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Final { text, .. } if text == "hello world"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_final_decode_falls_back_to_latest_partial() {
        struct SlowEngine;
        impl SpeechEngine for SlowEngine {
            fn is_ready(&self) -> bool {
                true
            }
            fn transcribe(&self, samples: &[i16]) -> Result<String, EngineError> {
                if samples.is_empty() {
                    return Ok(String::new());
                }
                // Partial decode answers fast, the final decode hangs
                if samples.len() <= PARTIAL_DECODE_STRIDE {
                    Ok("partial text".to_string())
                } else {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok("should lose".to_string())
                }
            }
        }

        let mut backend = LocalBackend::new(Arc::new(SlowEngine))
            .with_finish_timeout(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(8);
        backend.start(tx).unwrap();

        // One stride of audio -> partial decode
        for _ in 0..50 {
            backend.append_audio(vec![0i16; 320]);
        }
        let partial = rx.recv().await.unwrap();
        assert!(matches!(partial, BackendEvent::Partial { .. }));

        // More audio so the final decode sees a bigger buffer and hangs
        backend.append_audio(vec![0i16; 320]);
        backend.finish();

        let event = rx.recv().await.unwrap();
        assert!(
            matches!(event, BackendEvent::Final { text, .. } if text == "partial text"),
            "fallback must use the text known at timeout"
        );

        // The slow decode completing later must not produce a second final
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error() {
        let engine = ScriptedEngine::new(vec![Err(EngineError::Cancelled)]);
        let mut backend = LocalBackend::new(engine);
        let (tx, mut rx) = mpsc::channel(8);
        backend.start(tx).unwrap();

        backend.append_audio(vec![0i16; 320]);
        backend.finish();

        // Cancelled final decode falls back to current text (empty here)
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Final { text, .. } if text.is_empty()));
    }
}
