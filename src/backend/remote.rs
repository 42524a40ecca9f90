//! Cloud streaming backend (WebSocket)
//!
//! Manages the WebSocket connection lifecycle for streaming transcription.
//!
//! # Connection Flow
//!
//! 1. `start()` - validate the credential, spawn the connect/receive task and
//!    the writer task, return immediately
//! 2. Audio chunks are parked in a bounded pending queue until the server's
//!    `session_started` arrives, then flushed in original order
//! 3. `finish()` - send one commit message, arm the 2 s fallback
//! 4. `stop()` - flip the stopping flag, close the socket; everything the
//!    transport produces after that is discarded, not reported
//!
//! A protocol-level ping goes out every 15 seconds while the socket is open;
//! a failed ping is logged but never fatal - the receive loop's own error
//! handling decides when the session is actually dead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::pending::PendingAudioQueue;
use super::protocol::{connect_url, ClientMessage, ServerMessage};
use super::{BackendError, BackendEvent, EventSink, TranscriptionBackend, FINISH_TIMEOUT};

/// Connection timeout for the initial WebSocket handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol-level keepalive period
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Capacity of the writer command channel; large enough that pre-connection
/// bounding is done by the pending queue, not by channel backpressure
const WRITER_QUEUE: usize = 512;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection parameters for the streaming provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub model: String,
    pub include_timestamps: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.elevenlabs.io/v1/speech-to-text/realtime".to_string(),
            model: "scribe_v1".to_string(),
            include_timestamps: false,
        }
    }
}

/// Commands handled by the writer task.
enum WriterCmd {
    Chunk(Vec<i16>),
    SessionReady,
    Commit,
    Close,
}

/// Pure send-side state: decides, per command, which protocol messages go out.
/// Keeps the ordering rules (park until ready, flush in order, commit after
/// the flush) testable without a socket.
struct WriterState {
    ready: bool,
    queue: PendingAudioQueue,
    commit_pending: bool,
}

impl WriterState {
    fn new() -> Self {
        Self {
            ready: false,
            queue: PendingAudioQueue::default(),
            commit_pending: false,
        }
    }

    fn on_chunk(&mut self, samples: Vec<i16>) -> Vec<ClientMessage> {
        if self.ready {
            vec![ClientMessage::audio_chunk(&samples)]
        } else {
            self.queue.push(samples);
            vec![]
        }
    }

    fn on_session_ready(&mut self) -> Vec<ClientMessage> {
        self.ready = true;
        let mut out: Vec<ClientMessage> = self
            .queue
            .drain_all()
            .iter()
            .map(|chunk| ClientMessage::audio_chunk(chunk))
            .collect();
        if self.commit_pending {
            self.commit_pending = false;
            out.push(ClientMessage::commit());
        }
        out
    }

    fn on_commit(&mut self) -> Vec<ClientMessage> {
        if self.ready {
            vec![ClientMessage::commit()]
        } else {
            // The user released before the server even accepted the session;
            // commit right after the queued audio once it connects.
            self.commit_pending = true;
            vec![]
        }
    }
}

/// WebSocket streaming backend.
pub struct RemoteBackend {
    config: RemoteConfig,
    api_key: Option<String>,
    sink: Option<Arc<EventSink>>,
    cmd_tx: Option<mpsc::Sender<WriterCmd>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig, api_key: Option<String>) -> Self {
        Self {
            config,
            api_key,
            sink: None,
            cmd_tx: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn send_cmd(&self, cmd: WriterCmd) {
        if let Some(tx) = &self.cmd_tx {
            if tx.try_send(cmd).is_err() {
                log::debug!("Remote writer queue full or closed; command dropped");
            }
        }
    }
}

impl TranscriptionBackend for RemoteBackend {
    fn start(&mut self, events: mpsc::Sender<BackendEvent>) -> Result<(), BackendError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| BackendError::Unavailable("no API key configured".to_string()))?;

        let sink = EventSink::new(events);
        let (cmd_tx, cmd_rx) = mpsc::channel(WRITER_QUEUE);
        let (socket_tx, socket_rx) = oneshot::channel();

        let writer = tokio::spawn(run_writer(cmd_rx, socket_rx, Arc::clone(&sink)));
        let receiver = tokio::spawn(run_connection(
            self.config.clone(),
            api_key,
            socket_tx,
            cmd_tx.clone(),
            Arc::clone(&sink),
        ));

        self.sink = Some(sink);
        self.cmd_tx = Some(cmd_tx);
        *self.tasks.lock().unwrap() = vec![writer, receiver];
        Ok(())
    }

    fn append_audio(&self, samples: Vec<i16>) {
        self.send_cmd(WriterCmd::Chunk(samples));
    }

    fn finish(&self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        self.send_cmd(WriterCmd::Commit);

        // Backend-internal fallback: if the committed transcript has not
        // arrived in time, the latest partial becomes the final result.
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FINISH_TIMEOUT).await;
            if sink.has_finalized() || sink.is_stopping() {
                return;
            }
            let text = sink.current_text();
            log::info!(
                "Commit timed out after {:?}; falling back to latest partial ({} chars)",
                FINISH_TIMEOUT,
                text.len()
            );
            sink.finalize(text);
            if let Some(tx) = cmd_tx {
                let _ = tx.try_send(WriterCmd::Close);
            }
        });
    }

    fn stop(&self) {
        let Some(sink) = &self.sink else {
            return;
        };
        if !sink.begin_stop() {
            return;
        }
        log::debug!("Stopping remote backend");
        self.send_cmd(WriterCmd::Close);
        // The writer exits on Close; the receive loop ends when the socket
        // drops. Abort whatever is still around so no task outlives the
        // session.
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn current_text(&self) -> String {
        self.sink
            .as_ref()
            .map(|s| s.current_text())
            .unwrap_or_default()
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Establish the WebSocket, hand the write half to the writer task, then run
/// the receive loop until the socket dies or the backend stops.
async fn run_connection(
    config: RemoteConfig,
    api_key: String,
    socket_tx: oneshot::Sender<WsSink>,
    cmd_tx: mpsc::Sender<WriterCmd>,
    sink: Arc<EventSink>,
) {
    let url = connect_url(&config.endpoint, &config.model, config.include_timestamps);

    let mut request = match url.clone().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            sink.fail(BackendError::Transport(format!("invalid endpoint: {}", e)));
            return;
        }
    };
    match HeaderValue::from_str(&format!("Bearer {}", api_key)) {
        Ok(value) => {
            request.headers_mut().insert("Authorization", value);
        }
        Err(e) => {
            sink.fail(BackendError::Unavailable(format!("malformed API key: {}", e)));
            return;
        }
    }

    log::info!("Connecting to {} (model {})", config.endpoint, config.model);

    let ws_stream = match timeout(CONNECT_TIMEOUT, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            sink.fail(BackendError::Transport(format!("connect failed: {}", e)));
            return;
        }
        Err(_) => {
            sink.fail(BackendError::Transport("connect timed out".to_string()));
            return;
        }
    };

    let (write, mut read) = ws_stream.split();
    if socket_tx.send(write).is_err() {
        // Writer already gone; the backend was stopped during the handshake.
        return;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::SessionStarted { session_id }) => {
                    log::info!("Streaming session started: {}", session_id);
                    if cmd_tx.try_send(WriterCmd::SessionReady).is_err() {
                        log::warn!("Writer gone before session start");
                        break;
                    }
                }
                Ok(ServerMessage::PartialTranscript { text }) => {
                    sink.partial(text);
                }
                Ok(ServerMessage::CommittedTranscript { text })
                | Ok(ServerMessage::CommittedTranscriptWithTimestamps { text }) => {
                    sink.finalize(text);
                }
                Ok(msg) => {
                    if let Some(message) = msg.error_message() {
                        sink.fail(BackendError::Server(message.to_string()));
                    } else {
                        log::debug!("Ignoring unhandled server message");
                    }
                }
                Err(e) => {
                    log::warn!("Failed to parse server message: {}", e);
                }
            },
            Ok(Message::Close(_)) => {
                // A close after the committed transcript is a normal shutdown
                if !sink.has_finalized() {
                    sink.fail(BackendError::Transport(
                        "connection closed by server".to_string(),
                    ));
                }
                break;
            }
            Ok(_) => {} // ping/pong/binary
            Err(e) => {
                // Deliberate teardown produces transport errors here; the
                // stopping flag inside the sink absorbs them.
                sink.fail(BackendError::Transport(e.to_string()));
                break;
            }
        }
    }
    log::debug!("Receive loop exiting");
}

/// Own the write half: park audio until the session is ready, flush in order,
/// send live chunks, keep the socket alive with periodic pings.
async fn run_writer(
    mut cmd_rx: mpsc::Receiver<WriterCmd>,
    mut socket_rx: oneshot::Receiver<WsSink>,
    sink: Arc<EventSink>,
) {
    let mut write: Option<WsSink> = None;
    let mut state = WriterState::new();
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            socket = &mut socket_rx, if write.is_none() => {
                match socket {
                    Ok(w) => write = Some(w),
                    Err(_) => break, // connect failed; receive task reported it
                }
            }

            _ = keepalive.tick(), if write.is_some() => {
                if let Some(w) = write.as_mut() {
                    if let Err(e) = w.send(Message::Ping(Vec::new())).await {
                        log::warn!("Keepalive ping failed: {}", e);
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    WriterCmd::Chunk(samples) => {
                        let out = state.on_chunk(samples);
                        if !send_all(&mut write, out, &sink).await {
                            break;
                        }
                    }
                    WriterCmd::SessionReady => {
                        let out = state.on_session_ready();
                        log::debug!("Session ready; flushing {} parked chunk(s)", out.len());
                        if !send_all(&mut write, out, &sink).await {
                            break;
                        }
                    }
                    WriterCmd::Commit => {
                        let out = state.on_commit();
                        if !send_all(&mut write, out, &sink).await {
                            break;
                        }
                    }
                    WriterCmd::Close => {
                        if let Some(mut w) = write.take() {
                            if let Err(e) = w.close().await {
                                log::debug!("Error closing WebSocket: {}", e);
                            }
                        }
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Writer task exiting");
}

/// Serialize and send a batch of messages. Returns false when the socket is
/// dead and the writer should exit.
async fn send_all(write: &mut Option<WsSink>, messages: Vec<ClientMessage>, sink: &EventSink) -> bool {
    let Some(w) = write.as_mut() else {
        // Not connected yet and the message was not parkable (should not
        // happen: WriterState parks everything while not ready)
        return true;
    };
    for msg in messages {
        let json = match serde_json::to_string(&msg) {
            Ok(j) => j,
            Err(e) => {
                log::warn!("Failed to serialize client message: {}", e);
                continue;
            }
        };
        if let Err(e) = w.send(Message::Text(json)).await {
            if !sink.is_stopping() {
                log::warn!("WebSocket send failed: {}", e);
            }
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_count(messages: &[ClientMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, ClientMessage::InputAudioChunk { commit: false, .. }))
            .count()
    }

    #[test]
    fn chunks_before_session_start_are_parked_then_flushed_in_order() {
        let mut state = WriterState::new();

        assert!(state.on_chunk(vec![1; 320]).is_empty());
        assert!(state.on_chunk(vec![2; 320]).is_empty());

        let flushed = state.on_session_ready();
        assert_eq!(chunk_count(&flushed), 2);

        // Parked audio goes out before any newly-arriving live chunk
        let first = ClientMessage::audio_chunk(&[1i16; 320]);
        let ClientMessage::InputAudioChunk { audio: expected, .. } = first;
        let ClientMessage::InputAudioChunk { audio: got, .. } = &flushed[0];
        assert_eq!(got, &expected);

        let live = state.on_chunk(vec![3; 320]);
        assert_eq!(chunk_count(&live), 1);
    }

    #[test]
    fn commit_before_session_start_is_deferred_until_after_flush() {
        let mut state = WriterState::new();
        state.on_chunk(vec![1; 320]);
        assert!(state.on_commit().is_empty());

        let out = state.on_session_ready();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            out.last().unwrap(),
            ClientMessage::InputAudioChunk { commit: true, .. }
        ));
    }

    #[test]
    fn commit_when_ready_goes_straight_out() {
        let mut state = WriterState::new();
        state.on_session_ready();
        let out = state.on_commit();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            ClientMessage::InputAudioChunk { commit: true, .. }
        ));
    }

    #[tokio::test]
    async fn start_without_api_key_is_unavailable() {
        let mut backend = RemoteBackend::new(RemoteConfig::default(), None);
        let (tx, _rx) = mpsc::channel(8);
        let err = backend.start(tx).unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_current_text_safe_before_start() {
        let backend = RemoteBackend::new(RemoteConfig::default(), Some("key".to_string()));
        assert_eq!(backend.current_text(), "");
        backend.stop();
        backend.stop();
    }
}
