//! Error types shared across the gateway.
//!
//! The split matters for session shutdown: errors that are local to one
//! inbound frame are converted to `error` events at the point of occurrence,
//! while `SessionError` values propagate to the task-group boundary where
//! they are classified exactly once.

use thiserror::Error;

/// Backing services the gateway depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    SpeechToText,
    TextToSpeech,
    Chat,
    VoiceCloning,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::SpeechToText => write!(f, "speech-to-text"),
            Service::TextToSpeech => write!(f, "text-to-speech"),
            Service::Chat => write!(f, "chat"),
            Service::VoiceCloning => write!(f, "voice-cloning"),
        }
    }
}

/// Errors that end a realtime session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A backing service refused us because it is serving too many streams.
    #[error("service '{0}' is at capacity")]
    ServiceAtCapacity(Service),

    /// A backing service did not answer within its deadline.
    #[error("service '{0}' timed out")]
    ServiceTimeout(Service),

    /// The client websocket is gone. Expected on client-initiated
    /// disconnects; logged, never reported.
    #[error("websocket closed")]
    TransportClosed,

    /// A backing service misbehaved mid-stream.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Audio codec failure.
    #[error("audio codec error: {0}")]
    Codec(String),

    /// Anything else. Full detail stays server-side.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<opus::Error> for SessionError {
    fn from(e: opus::Error) -> Self {
        SessionError::Codec(e.to_string())
    }
}

/// Result alias used throughout the session pipeline.
pub type SessionResult<T> = Result<T, SessionError>;
