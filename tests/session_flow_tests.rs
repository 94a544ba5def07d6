//! End-to-end session tests against mock backing services.

mod mock_services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use sotto_gateway::audio::{FRAME_SIZE, OpusStreamEncoder};
use sotto_gateway::{AppState, ServerConfig, routes};

use mock_services::{MockLlm, MockStt, MockTts};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestGateway {
    addr: std::net::SocketAddr,
    #[allow(dead_code)]
    stt: MockStt,
    tts: MockTts,
    llm: MockLlm,
}

async fn spawn_gateway(max_sessions: usize) -> TestGateway {
    let stt = MockStt::start().await;
    let tts = MockTts::start().await;
    let llm = MockLlm::start().await;

    let config = ServerConfig {
        stt_url: stt.ws_url(),
        tts_url: tts.ws_url(),
        llm_url: llm.http_url(),
        characters_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("characters"),
        max_sessions,
        ..Default::default()
    };

    let state: Arc<AppState> = AppState::new(config).await.expect("app state");
    let app = Router::new()
        .merge(routes::api::create_api_router())
        .merge(routes::realtime::create_realtime_router())
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestGateway {
        addr,
        stt,
        tts,
        llm,
    }
}

async fn connect_client(gateway: &TestGateway) -> WsClient {
    let mut request = format!("ws://{}/v1/realtime", gateway.addr)
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("realtime"),
    );
    let (ws, response) = connect_async(request).await.expect("connect");
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("realtime"),
        "subprotocol must be negotiated"
    );
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

async fn next_json(ws: &mut WsClient, deadline: Duration) -> Value {
    let next = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).expect("server sends JSON");
                }
                Some(Ok(_)) => continue,
                other => panic!("websocket ended unexpectedly: {other:?}"),
            }
        }
    };
    tokio::time::timeout(deadline, next)
        .await
        .expect("timed out waiting for event")
}

/// Collect events until one of the given type arrives (inclusive).
async fn collect_until(ws: &mut WsClient, event_type: &str, deadline: Duration) -> Vec<Value> {
    let collect = async {
        let mut events = Vec::new();
        loop {
            let event = next_json(ws, Duration::from_secs(10)).await;
            let done = event["type"] == event_type;
            events.push(event);
            if done {
                return events;
            }
        }
    };
    tokio::time::timeout(deadline, collect)
        .await
        .expect("timed out collecting events")
}

fn events_of<'a>(events: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e["type"] == event_type)
        .collect()
}

fn joined_text_deltas(events: &[Value]) -> String {
    events_of(events, "response.text.delta")
        .iter()
        .map(|e| e["delta"].as_str().unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_malformed_frame_then_valid_update() {
    let gateway = spawn_gateway(4).await;
    let mut ws = connect_client(&gateway).await;

    ws.send(Message::Text("this is not json".into()))
        .await
        .expect("send garbage");
    send_json(
        &mut ws,
        json!({"type": "session.update", "session": {"allow_recording": false}}),
    )
    .await;

    // Exactly one error, then exactly one acknowledgement.
    let first = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(first["type"], "error");
    assert_eq!(first["error"]["type"], "invalid_request_error");
    assert!(first["event_id"].as_str().expect("id").starts_with("event_"));

    let second = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(second["type"], "session.updated");
    assert_eq!(second["session"]["allow_recording"], false);

    // The session survived: it still answers requests.
    send_json(&mut ws, json!({"type": "session.characters.list"})).await;
    let third = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(third["type"], "session.characters.listed");
    assert!(third["character_count"].as_u64().expect("count") >= 3);
}

#[tokio::test]
async fn test_unknown_event_type_is_rejected_not_ignored() {
    let gateway = spawn_gateway(4).await;
    let mut ws = connect_client(&gateway).await;

    send_json(&mut ws, json!({"type": "response.create"})).await;
    let event = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_admission_ceiling_queues_excess_sessions() {
    let gateway = spawn_gateway(1).await;

    let mut first = connect_client(&gateway).await;
    send_json(
        &mut first,
        json!({"type": "session.update", "session": {"allow_recording": false}}),
    )
    .await;
    let ack = next_json(&mut first, Duration::from_secs(5)).await;
    assert_eq!(ack["type"], "session.updated");

    // With capacity 1 the second connection must not reach RUNNING while
    // the first is alive.
    let mut second = connect_client(&gateway).await;
    send_json(
        &mut second,
        json!({"type": "session.update", "session": {"allow_recording": false}}),
    )
    .await;
    let waited = tokio::time::timeout(Duration::from_millis(300), second.next()).await;
    assert!(waited.is_err(), "queued session must not process frames yet");

    // Releasing the first slot lets the queued session run.
    first.close(None).await.expect("close first");
    let ack = next_json(&mut second, Duration::from_secs(5)).await;
    assert_eq!(ack["type"], "session.updated");
}

#[tokio::test]
async fn test_character_reload_error_codes() {
    let gateway = spawn_gateway(4).await;
    let mut ws = connect_client(&gateway).await;

    send_json(
        &mut ws,
        json!({"type": "session.characters.reload", "directory": "/definitely/not/here"}),
    )
    .await;
    let event = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["error"]["type"], "server_error");
    assert_eq!(event["error"]["code"], "directory_not_found");

    // The session is still usable, and reloading the default alias works.
    send_json(
        &mut ws,
        json!({"type": "session.characters.reload", "directory": "default"}),
    )
    .await;
    let event = next_json(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(event["type"], "session.characters.reloaded");
    assert!(event["loaded_count"].as_u64().expect("count") >= 3);
    let names: Vec<&str> = event["characters"]
        .as_array()
        .expect("roster")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"charles"));
}

#[tokio::test]
async fn test_tool_turn_executes_once_and_requeries_without_tools() {
    let gateway = spawn_gateway(4).await;
    let mut ws = connect_client(&gateway).await;

    // Selecting a fresh character makes the bot open the conversation;
    // the narrator declares tools, so the first upstream request carries
    // them and the mock answers with a tool call.
    send_json(
        &mut ws,
        json!({"type": "session.update", "session": {"voice": "narrator", "allow_recording": false}}),
    )
    .await;

    let events = collect_until(&mut ws, "response.audio.done", Duration::from_secs(15)).await;

    let created = events_of(&events, "response.created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["response"]["voice"], "narrator");
    assert_eq!(created[0]["response"]["status"], "in_progress");

    assert_eq!(joined_text_deltas(&events), "Hello there friend.");
    let done = events_of(&events, "response.text.done");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["text"], "Hello there friend.");
    assert!(!events_of(&events, "response.audio.delta").is_empty());

    // Exactly one execute+re-query cycle: two upstream requests, tools on
    // the first only.
    let requests = gateway.llm.requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].get("tools").is_some());
    assert!(requests[1].get("tools").is_none());

    let second_messages = requests[1]["messages"].as_array().expect("messages");
    let assistant_with_calls = second_messages
        .iter()
        .find(|m| m["role"] == "assistant" && m.get("tool_calls").is_some())
        .expect("assistant tool-call message");
    assert_eq!(
        assistant_with_calls["tool_calls"][0]["function"]["name"],
        "log_event"
    );
    let tool_result = second_messages
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("tool result message");
    assert_eq!(tool_result["tool_call_id"], "call_1");
    assert_eq!(tool_result["content"], "Logged: story begins");

    // The TTS got whole words.
    let spoken = gateway.tts.spoken.lock().clone();
    assert_eq!(spoken, vec!["Hello", " there", " friend."]);
}

#[tokio::test]
async fn test_audio_roundtrip_through_stt_and_response() {
    let gateway = spawn_gateway(4).await;
    let mut ws = connect_client(&gateway).await;

    // Greeting turn first, so the user's words land in a real history.
    send_json(
        &mut ws,
        json!({"type": "session.update", "session": {"voice": "charles", "allow_recording": false}}),
    )
    .await;
    let greeting = collect_until(&mut ws, "response.audio.done", Duration::from_secs(15)).await;
    assert_eq!(joined_text_deltas(&greeting), "Hello there friend.");

    // Send opus audio; the mock STT answers it with two words and a pause.
    let mut encoder = OpusStreamEncoder::new().expect("encoder");
    let pcm: Vec<i16> = (0..FRAME_SIZE * 3)
        .map(|i| ((i as f32 * 0.03).sin() * 6000.0) as i16)
        .collect();
    let opus = encoder.append_pcm(&pcm).expect("encode");
    send_json(
        &mut ws,
        json!({
            "type": "input_audio_buffer.append",
            "audio": base64_encode(&opus),
        }),
    )
    .await;

    let events = collect_until(&mut ws, "response.audio.done", Duration::from_secs(15)).await;

    assert_eq!(events_of(&events, "input_audio_buffer.speech_started").len(), 1);
    assert_eq!(events_of(&events, "input_audio_buffer.speech_stopped").len(), 1);

    let transcription = events_of(
        &events,
        "conversation.item.input_audio_transcription.delta",
    );
    assert_eq!(transcription.len(), 2);
    assert_eq!(transcription[0]["delta"], "hello");
    assert_eq!(transcription[0]["start_time"], 0.25);
    assert_eq!(transcription[1]["delta"], "there");

    // The user's merged words reach the model on the follow-up turn.
    let requests = gateway.llm.requests.lock().clone();
    let last = requests.last().expect("requests recorded");
    let user_contents: Vec<&str> = last["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter(|m| m["role"] == "user")
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert!(user_contents.contains(&"hello there"));

    assert!(!events_of(&events, "response.audio.delta").is_empty());
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
