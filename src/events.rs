//! Realtime protocol event types.
//!
//! Two disjoint alphabets: client events flow into the session engine,
//! server events flow out. Every event is an internally-tagged JSON object;
//! outbound events get a freshly generated `event_id` on each emission.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::chat::prompt::Instructions;

/// Subprotocol negotiated at the websocket handshake.
pub const SUBPROTOCOL: &str = "realtime";

/// Maximum allowed size for a constant instruction text (100 KB)
pub const MAX_INSTRUCTIONS_SIZE: usize = 100 * 1024;

/// Maximum allowed size for one base64 audio payload (1 MB)
pub const MAX_AUDIO_CHUNK_SIZE: usize = 1024 * 1024;

/// e.g. `event_67e5504410b1426f9247bb680e5fe0c8`
pub fn random_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Session configuration, replaced wholesale by `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub instructions: Option<Instructions>,
    #[serde(default)]
    pub voice: Option<String>,
    pub allow_recording: bool,
}

// =============================================================================
// Incoming events (client -> server)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64-encoded Ogg-Opus audio.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Reload this session's character set from a directory. The literal
    /// `"default"` resolves to the configured default directory.
    #[serde(rename = "session.characters.reload")]
    CharactersReload { directory: String },

    #[serde(rename = "session.characters.list")]
    CharactersList,

    /// Recording-only stand-in for audio appends: carries sample counts,
    /// never audio. Not expected from a real client.
    #[serde(rename = "gateway.input_audio_buffer.append_anonymized")]
    InputAudioBufferAppendAnonymized { number_of_samples: usize },

    /// Informational debug payload. Logged and dropped, never an error.
    #[serde(rename = "gateway.additional_outputs")]
    AdditionalOutputs { args: serde_json::Value },
}

/// Error type for client event validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventValidationError {
    InstructionsTooLarge { size: usize, max: usize },
    AudioChunkTooLarge { size: usize, max: usize },
}

impl std::fmt::Display for EventValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstructionsTooLarge { size, max } => {
                write!(f, "Instructions too large: {size} bytes (max: {max} bytes)")
            }
            Self::AudioChunkTooLarge { size, max } => {
                write!(f, "Audio chunk too large: {size} bytes (max: {max} bytes)")
            }
        }
    }
}

impl std::error::Error for EventValidationError {}

impl ClientEvent {
    /// Validates field sizes to prevent resource exhaustion.
    pub fn validate_size(&self) -> Result<(), EventValidationError> {
        match self {
            ClientEvent::SessionUpdate { session } => {
                if let Some(Instructions::Constant { text }) = &session.instructions {
                    let size = text.len();
                    if size > MAX_INSTRUCTIONS_SIZE {
                        return Err(EventValidationError::InstructionsTooLarge {
                            size,
                            max: MAX_INSTRUCTIONS_SIZE,
                        });
                    }
                }
            }
            ClientEvent::InputAudioBufferAppend { audio } => {
                let size = audio.len();
                if size > MAX_AUDIO_CHUNK_SIZE {
                    return Err(EventValidationError::AudioChunkTooLarge {
                        size,
                        max: MAX_AUDIO_CHUNK_SIZE,
                    });
                }
            }
            ClientEvent::CharactersReload { .. }
            | ClientEvent::CharactersList
            | ClientEvent::InputAudioBufferAppendAnonymized { .. }
            | ClientEvent::AdditionalOutputs { .. } => {}
        }
        Ok(())
    }
}

/// Parse one inbound text frame.
///
/// Distinguishes malformed JSON from a schema mismatch so the resulting
/// `invalid_request_error` can carry field-level details for the latter.
pub fn parse_client_event(raw: &str) -> Result<ClientEvent, ServerEvent> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ServerEvent::invalid_request(format!("Invalid JSON: {e}"), None))?;

    let event: ClientEvent = serde_json::from_value(value).map_err(|e| {
        ServerEvent::invalid_request(
            "Invalid message".to_string(),
            Some(serde_json::json!({ "reason": e.to_string() })),
        )
    })?;

    event.validate_size().map_err(|e| {
        ServerEvent::invalid_request(
            e.to_string(),
            None,
        )
    })?;

    Ok(event)
}

// =============================================================================
// Outgoing events (server -> client)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Turn header sent as `response.created`.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsePayload {
    pub object: &'static str,
    pub status: &'static str,
    pub voice: String,
    pub chat_history: Vec<ChatMessage>,
}

impl ResponsePayload {
    pub fn in_progress(voice: String, chat_history: Vec<ChatMessage>) -> Self {
        ResponsePayload {
            object: "realtime.response",
            status: "in_progress",
            voice,
            chat_history,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CharacterInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub good: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ErrorPayload },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionConfig },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponsePayload },

    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },

    #[serde(rename = "response.text.done")]
    ResponseTextDone { text: String },

    /// Base64-encoded Ogg-Opus audio.
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta { delta: String, start_time: f64 },

    /// Speech started according to the STT, not the VAD: the VAD sometimes
    /// fires without anything getting transcribed afterwards.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "gateway.interrupted_by_vad")]
    InterruptedByVad,

    #[serde(rename = "session.characters.reloaded")]
    CharactersReloaded {
        directory: String,
        total_files: usize,
        loaded_count: usize,
        error_count: usize,
        characters: Vec<CharacterInfo>,
    },

    #[serde(rename = "session.characters.listed")]
    CharactersListed {
        directory: String,
        character_count: usize,
        characters: Vec<CharacterInfo>,
    },

    #[serde(rename = "gateway.additional_outputs")]
    AdditionalOutputs { args: serde_json::Value },
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: String,
    #[serde(flatten)]
    event: &'a ServerEvent,
}

impl ServerEvent {
    /// Serialize for the wire with a fresh `event_id`. Ids are never reused,
    /// even when the same event value is emitted twice.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            event_id: random_id("event"),
            event: self,
        })
    }

    pub fn invalid_request(message: String, details: Option<serde_json::Value>) -> Self {
        ServerEvent::Error {
            error: ErrorPayload {
                error_type: "invalid_request_error".to_string(),
                code: None,
                message,
                details,
            },
        }
    }

    pub fn server_error(code: &str, message: String) -> Self {
        ServerEvent::Error {
            error: ErrorPayload {
                error_type: "server_error".to_string(),
                code: Some(code.to_string()),
                message,
                details: None,
            },
        }
    }

    /// Terminal error shown to the user before the session closes.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::server_error("fatal", message.into())
    }
}
