//! Streaming text-to-speech client.
//!
//! One connection per response turn. Words go up as text frames, a
//! zero-byte binary frame flushes, and PCM comes back as binary frames
//! until the service closes the stream.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};
use url::Url;

use crate::errors::{Service, SessionError, SessionResult};

use super::{CONNECT_TIMEOUT, classify_ws_error};

const WORD_CHANNEL_CAPACITY: usize = 256;
const AUDIO_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// Synthesized PCM, 16-bit mono at the gateway sample rate.
    Audio(Vec<i16>),
    /// The service finished this turn's audio.
    Done,
    Error(String),
}

#[derive(Debug)]
enum TtsCommand {
    Word(String),
    Flush,
}

pub struct TextToSpeech {
    command_tx: mpsc::Sender<TtsCommand>,
    events_rx: mpsc::Receiver<TtsEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl TextToSpeech {
    pub async fn connect(url: &str, voice: &str) -> SessionResult<Self> {
        let mut endpoint = Url::parse(&format!(
            "{}/api/tts_streaming",
            url.trim_end_matches('/')
        ))
        .map_err(|e| SessionError::Upstream(format!("invalid tts url: {e}")))?;
        endpoint.query_pairs_mut().append_pair("voice", voice);

        let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| SessionError::ServiceTimeout(Service::TextToSpeech))?
            .map_err(|e| classify_ws_error(e, Service::TextToSpeech))?;
        info!(voice, "TTS connection established");

        let (command_tx, command_rx) = mpsc::channel(WORD_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(ws, command_rx, events_tx));

        Ok(TextToSpeech {
            command_tx,
            events_rx,
            task,
        })
    }

    /// A detached word sender, so the connection itself can live inside
    /// the audio-pump task while the response loop keeps feeding words.
    pub fn sender(&self) -> TtsSender {
        TtsSender(self.command_tx.clone())
    }

    pub async fn next_event(&mut self) -> TtsEvent {
        self.events_rx.recv().await.unwrap_or(TtsEvent::Done)
    }
}

/// Clonable word/flush sender detached from the connection's lifetime.
#[derive(Clone)]
pub struct TtsSender(mpsc::Sender<TtsCommand>);

impl TtsSender {
    pub async fn send_word(&self, word: String) -> SessionResult<()> {
        self.0
            .send(TtsCommand::Word(word))
            .await
            .map_err(|_| SessionError::Upstream("tts connection closed".to_string()))
    }

    /// Signal end of input; the service will finish synthesizing and close.
    pub async fn flush(&self) -> SessionResult<()> {
        self.0
            .send(TtsCommand::Flush)
            .await
            .map_err(|_| SessionError::Upstream("tts connection closed".to_string()))
    }
}

impl Drop for TextToSpeech {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    mut command_rx: mpsc::Receiver<TtsCommand>,
    events_tx: mpsc::Sender<TtsEvent>,
) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let result = match command {
                    Some(TtsCommand::Word(word)) => sink.send(Message::Text(word.into())).await,
                    Some(TtsCommand::Flush) => sink.send(Message::Binary(vec![0u8].into())).await,
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to send text to TTS");
                    let _ = events_tx.send(TtsEvent::Error(e.to_string())).await;
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        let pcm: Vec<i16> = data
                            .chunks_exact(2)
                            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                            .collect();
                        if !pcm.is_empty() && events_tx.send(TtsEvent::Audio(pcm)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(TtsEvent::Done).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events_tx.send(TtsEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }
}
