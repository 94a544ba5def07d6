//! Streaming speech-to-text client.
//!
//! One connection per session. PCM goes up as binary frames; transcript
//! words and endpoint signals come back as JSON text frames.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::errors::{Service, SessionError, SessionResult};

use super::{CONNECT_TIMEOUT, classify_ws_error};

/// Bounded for backpressure: audio production must not outrun the socket.
const PCM_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events surfaced by the STT service.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Service accepted the stream.
    Ready,
    /// One transcribed word with its start timestamp in seconds.
    Word { text: String, start_time: f64 },
    /// The service detected an endpoint pause.
    Pause,
    /// Service-reported error; fatal for the session.
    Error(String),
    /// The connection is gone.
    Closed,
}

/// Wire messages from the STT service.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SttMessage {
    Ready,
    Word { text: String, start_time: f64 },
    Pause,
    Error { message: String },
}

pub struct SpeechToText {
    pcm_tx: mpsc::Sender<Vec<i16>>,
    events_rx: mpsc::Receiver<SttEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl SpeechToText {
    pub async fn connect(url: &str) -> SessionResult<Self> {
        let endpoint = format!("{}/api/asr-streaming", url.trim_end_matches('/'));
        let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(&endpoint))
            .await
            .map_err(|_| SessionError::ServiceTimeout(Service::SpeechToText))?
            .map_err(|e| classify_ws_error(e, Service::SpeechToText))?;
        info!(endpoint, "STT connection established");

        let (pcm_tx, pcm_rx) = mpsc::channel(PCM_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(ws, pcm_rx, events_tx));

        Ok(SpeechToText {
            pcm_tx,
            events_rx,
            task,
        })
    }

    /// Forward PCM to the service. Samples are 16-bit mono at the gateway
    /// sample rate.
    pub async fn send_pcm(&self, pcm: Vec<i16>) -> SessionResult<()> {
        self.pcm_tx
            .send(pcm)
            .await
            .map_err(|_| SessionError::Upstream("stt connection closed".to_string()))
    }

    /// A detached sender for the audio path, so the connection itself can
    /// live inside the event-pump task.
    pub fn pcm_sender(&self) -> SttSender {
        SttSender(self.pcm_tx.clone())
    }

    pub async fn next_event(&mut self) -> SttEvent {
        self.events_rx.recv().await.unwrap_or(SttEvent::Closed)
    }
}

impl Drop for SpeechToText {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Clonable PCM sender detached from the connection's lifetime.
#[derive(Clone)]
pub struct SttSender(mpsc::Sender<Vec<i16>>);

impl SttSender {
    pub async fn send_pcm(&self, pcm: Vec<i16>) -> SessionResult<()> {
        self.0
            .send(pcm)
            .await
            .map_err(|_| SessionError::Upstream("stt connection closed".to_string()))
    }
}

async fn run(
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    mut pcm_rx: mpsc::Receiver<Vec<i16>>,
    events_tx: mpsc::Sender<SttEvent>,
) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            pcm = pcm_rx.recv() => {
                let Some(pcm) = pcm else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    warn!(error = %e, "Failed to send audio to STT");
                    let _ = events_tx.send(SttEvent::Error(e.to_string())).await;
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let event = match serde_json::from_str::<SttMessage>(&text) {
                            Ok(SttMessage::Ready) => SttEvent::Ready,
                            Ok(SttMessage::Word { text, start_time }) => {
                                SttEvent::Word { text, start_time }
                            }
                            Ok(SttMessage::Pause) => SttEvent::Pause,
                            Ok(SttMessage::Error { message }) => SttEvent::Error(message),
                            Err(e) => {
                                debug!(error = %e, "Ignoring unparseable STT message");
                                continue;
                            }
                        };
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(SttEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events_tx.send(SttEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stt_message_parsing() {
        let message: SttMessage =
            serde_json::from_str(r#"{"type": "word", "text": "hello", "start_time": 1.25}"#)
                .expect("word");
        assert!(matches!(
            message,
            SttMessage::Word { ref text, start_time } if text == "hello" && start_time == 1.25
        ));

        let message: SttMessage = serde_json::from_str(r#"{"type": "pause"}"#).expect("pause");
        assert!(matches!(message, SttMessage::Pause));

        let message: SttMessage =
            serde_json::from_str(r#"{"type": "error", "message": "overloaded"}"#).expect("error");
        assert!(matches!(message, SttMessage::Error { .. }));
    }
}
