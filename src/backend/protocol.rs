//! Streaming transcription wire protocol
//!
//! JSON messages exchanged with the cloud recognizer over a WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://<endpoint>?model=...&audio_format=pcm_16000&include_timestamps=...&commit_strategy=manual`
//! 2. Receive `session_started`
//! 3. Stream audio via `input_audio_chunk` messages (base64 PCM16)
//! 4. Send a final chunk with `"commit": true` when the user releases the combo
//! 5. Receive `partial_transcript` events, then one `committed_transcript`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Messages sent from client to the recognizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Audio payload; `commit: true` asks the server to finalize the
    /// transcript for everything sent so far.
    #[serde(rename = "input_audio_chunk")]
    InputAudioChunk { audio: String, commit: bool },
}

impl ClientMessage {
    /// Build an audio message from raw i16 samples (little-endian on the wire).
    pub fn audio_chunk(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        Self::InputAudioChunk {
            audio: STANDARD.encode(&bytes),
            commit: false,
        }
    }

    /// Build the end-of-input commit message.
    pub fn commit() -> Self {
        Self::InputAudioChunk {
            audio: String::new(),
            commit: true,
        }
    }
}

/// Messages received from the recognizer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The server accepted the session; audio may now be sent
    #[serde(rename = "session_started")]
    SessionStarted {
        #[serde(default)]
        session_id: String,
    },

    /// Interim transcript for the audio received so far
    #[serde(rename = "partial_transcript")]
    PartialTranscript {
        #[serde(default)]
        text: String,
    },

    /// Final transcript after a commit
    #[serde(rename = "committed_transcript")]
    CommittedTranscript {
        #[serde(default)]
        text: String,
    },

    /// Final transcript with word timing; the timing payload is not used
    #[serde(rename = "committed_transcript_with_timestamps")]
    CommittedTranscriptWithTimestamps {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "auth_error")]
    AuthError {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "quota_exceeded")]
    QuotaExceeded {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "rate_limited")]
    RateLimited {
        #[serde(default)]
        message: String,
    },

    /// Catch-all for message types we don't handle.
    /// This prevents deserialization failures for unknown types.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// The server-provided message, when this is any of the error variants.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ServerMessage::Error { message }
            | ServerMessage::AuthError { message }
            | ServerMessage::QuotaExceeded { message }
            | ServerMessage::RateLimited { message } => Some(message),
            _ => None,
        }
    }
}

/// Build the connect URL with the session parameters the server expects.
pub fn connect_url(endpoint: &str, model: &str, include_timestamps: bool) -> String {
    format!(
        "{}?model={}&audio_format=pcm_16000&include_timestamps={}&commit_strategy=manual",
        endpoint.trim_end_matches('/'),
        model,
        include_timestamps
    )
}
