//! Boundaries to the backing services: liveness probing plus the STT and
//! TTS streaming clients. Chat completion lives in [`crate::llm`].

pub mod health;
pub mod stt;
pub mod tts;

pub use health::{HealthChecker, HealthStatus};
pub use stt::{SpeechToText, SttEvent, SttSender};
pub use tts::{TextToSpeech, TtsEvent, TtsSender};

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::errors::{Service, SessionError};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a websocket handshake failure onto the session error taxonomy.
/// Capacity-style HTTP rejections become at-capacity errors naming the
/// service; anything else is an upstream failure.
pub(crate) fn classify_ws_error(e: tungstenite::Error, service: Service) -> SessionError {
    match &e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::TOO_MANY_REQUESTS
                || status == http::StatusCode::SERVICE_UNAVAILABLE
            {
                SessionError::ServiceAtCapacity(service)
            } else {
                SessionError::Upstream(format!(
                    "{service} handshake failed with status {status}"
                ))
            }
        }
        _ => SessionError::Upstream(format!("{service} connection failed: {e}")),
    }
}
