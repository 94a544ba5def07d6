//! Hand-rolled mock backing services for end-to-end session tests.
//!
//! Each mock is a small axum server bound to an ephemeral port: STT and
//! TTS speak the websocket protocols the gateway expects, the chat mock
//! answers `/v1/models` and streams scripted SSE completions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use sotto_gateway::audio::FRAME_SIZE;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

// =============================================================================
// STT mock
// =============================================================================

/// Scripted STT: acknowledges the stream, then answers the first audio
/// frame with two words and an endpoint pause.
pub struct MockStt {
    pub addr: SocketAddr,
}

impl MockStt {
    pub async fn start() -> Self {
        let app = Router::new()
            .route("/api/build_info", get(|| async { "ok" }))
            .route(
                "/api/asr-streaming",
                get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(stt_socket) }),
            );
        MockStt {
            addr: serve(app).await,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

async fn stt_socket(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Text(json!({"type": "ready"}).to_string().into()))
        .await;

    let mut scripted = false;
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Binary(_)) && !scripted {
            scripted = true;
            for event in [
                json!({"type": "word", "text": "hello", "start_time": 0.25}),
                json!({"type": "word", "text": "there", "start_time": 0.75}),
                json!({"type": "pause"}),
            ] {
                if socket
                    .send(Message::Text(event.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// TTS mock
// =============================================================================

/// Scripted TTS: collects words until the zero-byte flush, then returns
/// two PCM frames and closes.
pub struct MockTts {
    pub addr: SocketAddr,
    pub spoken: Arc<Mutex<Vec<String>>>,
}

impl MockTts {
    pub async fn start() -> Self {
        let spoken: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let handler_spoken = spoken.clone();
        let app = Router::new()
            .route("/api/build_info", get(|| async { "ok" }))
            .route(
                "/api/tts_streaming",
                get(move |ws: WebSocketUpgrade| {
                    let spoken = handler_spoken.clone();
                    async move { ws.on_upgrade(move |socket| tts_socket(socket, spoken)) }
                }),
            );
        MockTts {
            addr: serve(app).await,
            spoken,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

async fn tts_socket(mut socket: WebSocket, spoken: Arc<Mutex<Vec<String>>>) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(word) => spoken.lock().push(word.to_string()),
            Message::Binary(data) if data.as_ref() == &[0u8][..] => {
                for _ in 0..2 {
                    let pcm: Vec<u8> = (0..FRAME_SIZE)
                        .flat_map(|i| ((i as i16) << 4).to_le_bytes())
                        .collect();
                    if socket.send(Message::Binary(pcm.into())).await.is_err() {
                        return;
                    }
                }
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

// =============================================================================
// Chat mock
// =============================================================================

/// Scripted chat completion server. Requests carrying tool declarations
/// get a tool-call stream; everything else gets plain content.
pub struct MockLlm {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl MockLlm {
    pub async fn start() -> Self {
        let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/v1/models",
                get(|| async { axum::Json(json!({"data": [{"id": "mock-model"}]})) }),
            )
            .route("/v1/chat/completions", post(completions))
            .with_state(requests.clone());
        MockLlm {
            addr: serve(app).await,
            requests,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn completions(
    State(requests): State<Arc<Mutex<Vec<Value>>>>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    requests.lock().push(body.clone());

    let sse = if body.get("tools").is_some() {
        concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[",
            "{\"index\":0,\"id\":\"call_1\",\"function\":",
            "{\"name\":\"log_event\",\"arguments\":\"{\\\"event\\\": \\\"story begins\\\"}\"}}",
            "]}}]}\n\n",
            "data: [DONE]\n\n",
        )
        .to_string()
    } else {
        concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"there friend.\"}}]}\n\n",
            "data: [DONE]\n\n",
        )
        .to_string()
    };

    (
        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
        sse,
    )
        .into_response()
}
