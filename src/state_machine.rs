//! Session state machine for talkey
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute. Every asynchronous producer
//! (combo monitor, audio relay, backend, timers) posts events into one channel;
//! the control loop reduces them in arrival order, so the state machine sees a
//! total order and never needs a lock.

use std::time::Duration;
use uuid::Uuid;

use crate::backend::BackendKind;

/// Armed by the orchestrator at session end; the safety net behind each
/// backend's own finish timeout.
pub const SESSION_FALLBACK_TIMEOUT: Duration = Duration::from_secs(4);

/// How long an error stays visible before the state auto-reverts to Idle.
pub const ERROR_DISPLAY_DELAY: Duration = Duration::from_secs(2);

/// Internal state of the dictation workflow.
/// This is the authoritative state - all transitions go through the reducer.
///
/// `last_seq` is the sequence stamp of the newest transcription result already
/// applied for the session; results with an older or equal stamp are dropped,
/// so a reordered transport can never roll the preview or the final text back.
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Recording {
        session_id: Uuid,
        last_seq: u64,
    },
    Processing {
        session_id: Uuid,
        last_seq: u64,
    },
    Error {
        error_id: Uuid,
        message: String,
    },
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl SessionState {
    /// The live session id, if a session is open.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Recording { session_id, .. } => Some(*session_id),
            SessionState::Processing { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

/// Events that can trigger state transitions.
/// Sent from the combo monitor, the audio relay, the active backend and the
/// orchestrator's own timers.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// All keys of the configured combo went down
    ComboEngaged,
    /// Any key of the combo came back up while engaged
    ComboReleased,
    /// A begin-session gate (permission, credential, engine) is closed.
    /// Produced by the control loop in place of ComboEngaged, before any
    /// capture or backend start is attempted.
    PreflightFailed {
        message: String,
    },
    /// Capture or backend start failed after the session was opened
    SessionOpenFailed {
        id: Uuid,
        message: String,
    },
    /// One resampled chunk from the audio relay
    AudioChunk {
        id: Uuid,
        samples: Vec<i16>,
    },

    // Backend results
    Partial {
        id: Uuid,
        seq: u64,
        text: String,
    },
    Final {
        id: Uuid,
        seq: u64,
        text: String,
    },
    BackendFailed {
        id: Uuid,
        message: String,
    },

    /// Orchestrator-level session timeout fired (includes id to prevent
    /// stale timers from concluding a newer session)
    SessionTimeout {
        id: Uuid,
    },
    /// Error display delay elapsed
    ErrorCleared {
        id: Uuid,
    },
    /// Change the active transcription provider
    SwitchProvider {
        kind: BackendKind,
    },
    /// Application exit requested
    Shutdown,
}

/// Effects to be executed after a state transition.
/// The orchestrator handles these; none of them block the control loop.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Start the audio source and the configured backend, in that order.
    /// If the audio source fails the backend is never started.
    OpenSession {
        id: Uuid,
    },
    /// Stop the audio source and invalidate its tap
    CloseCapture {
        id: Uuid,
    },
    /// Forward one resampled chunk to the live backend
    RelayAudio {
        id: Uuid,
        samples: Vec<i16>,
    },
    /// Signal end-of-input to the backend
    FinishBackend {
        id: Uuid,
    },
    /// Hard-cancel the backend and release its resources
    StopBackend {
        id: Uuid,
    },
    /// Schedule `SessionTimeout { id }`; the orchestrator owns the duration
    ArmSessionTimeout {
        id: Uuid,
    },
    /// Schedule `ErrorCleared { id }` after the error display delay
    ArmErrorClear {
        id: Uuid,
    },
    /// Deliver final text to the TextSink (guarded by the one-shot record)
    Dispatch {
        id: Uuid,
        text: String,
    },
    /// Deliver the backend's current_text at this moment, if non-empty
    FallbackDispatch {
        id: Uuid,
    },
    /// Push the latest partial text to the preview surface
    UpdatePreview {
        text: String,
    },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - A session concludes (dispatch or silence) at most once; after the
///   transition out of Processing every late result is stale by construction
pub fn reduce(state: &SessionState, event: ControlEvent) -> (SessionState, Vec<Effect>) {
    use ControlEvent::*;
    use Effect::*;
    use SessionState::*;

    match (state, event) {
        // -----------------
        // Session start
        // -----------------
        (Idle, ComboEngaged) | (Error { .. }, ComboEngaged) => {
            let id = Uuid::new_v4();
            (
                Recording {
                    session_id: id,
                    last_seq: 0,
                },
                vec![
                    UpdatePreview {
                        text: String::new(),
                    },
                    OpenSession { id },
                ],
            )
        }
        (Recording { .. }, ComboEngaged) | (Processing { .. }, ComboEngaged) => {
            // The edge detector should make this impossible, but a double
            // engage must never open a second session.
            log::warn!("Combo engaged while a session is already open; ignoring");
            (state.clone(), vec![])
        }

        (Idle, PreflightFailed { message }) | (Error { .. }, PreflightFailed { message }) => {
            let error_id = Uuid::new_v4();
            (
                Error { error_id, message },
                vec![ArmErrorClear { id: error_id }],
            )
        }

        (Recording { session_id, .. }, SessionOpenFailed { id, message })
            if *session_id == id =>
        {
            let error_id = Uuid::new_v4();
            (
                Error { error_id, message },
                vec![
                    CloseCapture { id },
                    StopBackend { id },
                    ArmErrorClear { id: error_id },
                ],
            )
        }

        // -----------------
        // Audio relay
        // -----------------
        (Recording { session_id, .. }, AudioChunk { id, samples }) if *session_id == id => {
            (state.clone(), vec![RelayAudio { id, samples }])
        }
        // Late chunks after the combo released: the commit is already on the
        // wire, drop them.
        (_, AudioChunk { .. }) => (state.clone(), vec![]),

        // -----------------
        // Session end
        // -----------------
        (
            Recording {
                session_id,
                last_seq,
            },
            ComboReleased,
        ) => (
            Processing {
                session_id: *session_id,
                last_seq: *last_seq,
            },
            vec![
                CloseCapture { id: *session_id },
                FinishBackend { id: *session_id },
                ArmSessionTimeout { id: *session_id },
            ],
        ),
        (_, ComboReleased) => (state.clone(), vec![]),

        // -----------------
        // Results
        // -----------------
        (
            Recording {
                session_id,
                last_seq,
            },
            Partial { id, seq, text },
        ) if *session_id == id && seq > *last_seq => (
            Recording {
                session_id: *session_id,
                last_seq: seq,
            },
            vec![UpdatePreview { text }],
        ),
        (
            Processing {
                session_id,
                last_seq,
            },
            Partial { id, seq, text },
        ) if *session_id == id && seq > *last_seq => (
            Processing {
                session_id: *session_id,
                last_seq: seq,
            },
            vec![UpdatePreview { text }],
        ),

        // A Final may arrive in Recording too (a server can finalize early);
        // either way it concludes the session. Empty text completes the
        // session silently - no dispatch, silence is not an error.
        (
            Recording {
                session_id,
                last_seq,
            },
            Final { id, seq, text },
        )
        | (
            Processing {
                session_id,
                last_seq,
            },
            Final { id, seq, text },
        ) if *session_id == id && seq > *last_seq => {
            let was_recording = matches!(state, Recording { .. });
            let mut effects = Vec::new();
            if was_recording {
                effects.push(CloseCapture { id });
            }
            let trimmed = text.trim();
            if trimmed.is_empty() {
                log::info!("Session {} finished with empty transcript", id);
            } else {
                effects.push(UpdatePreview {
                    text: trimmed.to_string(),
                });
                effects.push(Dispatch {
                    id,
                    text: trimmed.to_string(),
                });
            }
            effects.push(StopBackend { id });
            (Idle, effects)
        }

        (Recording { session_id, .. }, BackendFailed { id, message }) if *session_id == id => {
            let error_id = Uuid::new_v4();
            (
                Error { error_id, message },
                vec![
                    CloseCapture { id },
                    StopBackend { id },
                    ArmErrorClear { id: error_id },
                ],
            )
        }
        (Processing { session_id, .. }, BackendFailed { id, message }) if *session_id == id => {
            let error_id = Uuid::new_v4();
            (
                Error { error_id, message },
                vec![
                    StopBackend { id },
                    ArmErrorClear { id: error_id },
                ],
            )
        }

        // -----------------
        // Timeout fallback
        // -----------------
        (Processing { session_id, .. }, SessionTimeout { id }) if *session_id == id => {
            (Idle, vec![FallbackDispatch { id }, StopBackend { id }])
        }
        (_, SessionTimeout { .. }) => (state.clone(), vec![]),

        // -----------------
        // Error display
        // -----------------
        (Error { error_id, .. }, ErrorCleared { id }) if *error_id == id => (Idle, vec![]),
        (_, ErrorCleared { .. }) => (state.clone(), vec![]),

        // -----------------
        // Provider switch
        // -----------------
        // Safe while Idle/Error; mid-session the old backend is force-stopped
        // before the new kind can ever be instantiated.
        (Recording { session_id, .. }, SwitchProvider { kind })
        | (Processing { session_id, .. }, SwitchProvider { kind }) => {
            log::info!(
                "Provider switched to {:?} mid-session; tearing down session {}",
                kind,
                session_id
            );
            (
                Idle,
                vec![
                    CloseCapture { id: *session_id },
                    StopBackend { id: *session_id },
                ],
            )
        }
        (_, SwitchProvider { .. }) => (state.clone(), vec![]),

        // -----------------
        // Stale / unhandled events (drop silently)
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
