//! Streaming chat-completion client with tool round-trip handling.
//!
//! Talks to an OpenAI-compatible `/v1/chat/completions` endpoint over SSE.
//! One completion request moves through: streaming, tool execution (when
//! calls were detected), exactly one re-query with tool declarations
//! omitted, then the final stream.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::chat::prompt::ToolDispatch;
use crate::chat::{ChatMessage, Role};
use crate::config::ServerConfig;
use crate::errors::{Service, SessionError, SessionResult};

use super::tools::{ToolDefinition, ToolValidator, execute_tool};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Wire types
// =============================================================================

/// Message as submitted to the completions API. Richer than conversation
/// history messages: tool calls and tool results exist only here.
#[derive(Debug, Clone, Serialize)]
pub struct ApiMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ApiMessage {
    pub fn from_history(messages: &[ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role,
                content: Some(m.content.clone()),
                tool_calls: None,
                tool_call_id: None,
            })
            .collect()
    }

    fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ApiToolCall>) -> Self {
        ApiMessage {
            role: Role::Assistant,
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: String, content: String) -> Self {
        ApiMessage {
            role: Role::Tool,
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(call_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: ApiFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Tool call under assembly, keyed by the stream's per-call index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Fold one delta into the per-index assembly map. Ids and names replace,
/// argument fragments concatenate in arrival order.
pub(crate) fn apply_tool_call_delta(
    pending: &mut BTreeMap<u32, PendingToolCall>,
    delta: ToolCallDelta,
) {
    let entry = pending.entry(delta.index).or_default();
    if let Some(id) = delta.id {
        entry.id = id;
    }
    if let Some(function) = delta.function {
        if let Some(name) = function.name {
            entry.name = name;
        }
        if let Some(fragment) = function.arguments {
            entry.arguments.push_str(&fragment);
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// One completion request. Tools only fire when both a declaration set and
/// a dispatcher are present.
pub struct CompletionRequest {
    pub messages: Vec<ApiMessage>,
    pub tools: Vec<ToolDefinition>,
    pub dispatch: Option<Arc<dyn ToolDispatch>>,
    pub validators: Arc<HashMap<String, ToolValidator>>,
    pub character_name: String,
}

// =============================================================================
// Client
// =============================================================================

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    configured_model: Option<String>,
    temperature: f32,
    resolved_model: OnceCell<String>,
}

impl ChatClient {
    pub fn new(config: &ServerConfig) -> SessionResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Internal(e.into()))?;

        Ok(ChatClient {
            http,
            base_url: config.llm_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            configured_model: config.llm_model.clone(),
            temperature: config.llm_temperature,
            resolved_model: OnceCell::new(),
        })
    }

    /// The model to request: configured, or the single model the server
    /// offers. Resolved once and cached.
    pub async fn model(&self) -> SessionResult<String> {
        if let Some(model) = &self.configured_model {
            return Ok(model.clone());
        }

        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let model = self
            .resolved_model
            .get_or_try_init(|| async {
                let mut request = self.http.get(format!("{}/v1/models", self.base_url));
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key);
                }
                let list: ModelList = request
                    .send()
                    .await
                    .map_err(classify_request_error)?
                    .error_for_status()
                    .map_err(classify_request_error)?
                    .json()
                    .await
                    .map_err(|e| SessionError::Upstream(format!("model list: {e}")))?;

                match list.data.as_slice() {
                    [only] => Ok(only.id.clone()),
                    [] => Err(SessionError::Upstream(
                        "chat server offers no models".to_string(),
                    )),
                    _ => Err(SessionError::Upstream(
                        "multiple models available; set LLM_MODEL".to_string(),
                    )),
                }
            })
            .await?;

        Ok(model.clone())
    }

    async fn send_request(&self, body: &serde_json::Value) -> SessionResult<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if status == http::StatusCode::TOO_MANY_REQUESTS
            || status == http::StatusCode::SERVICE_UNAVAILABLE
        {
            return Err(SessionError::ServiceAtCapacity(Service::Chat));
        }
        if !status.is_success() {
            return Err(SessionError::Upstream(format!(
                "chat completion failed with status {status}"
            )));
        }
        Ok(response)
    }

    /// Stream content deltas for one turn, handling tool calls in between.
    ///
    /// When tools are declared, content is held back until the stream ends
    /// and it is known whether a tool fired: a tool-triggered turn must not
    /// leak partial assistant text before the results are folded in. Held
    /// content is flushed, never dropped, when no tool fired after all.
    pub fn chat_completion(
        self: Arc<Self>,
        mut request: CompletionRequest,
    ) -> impl Stream<Item = SessionResult<String>> + Send + 'static {
        try_stream! {
            let model = self.model().await?;
            let tools_declared = !request.tools.is_empty() && request.dispatch.is_some();

            let mut body = serde_json::json!({
                "model": model,
                "messages": request.messages,
                "stream": true,
                "temperature": self.temperature,
            });
            if tools_declared {
                body["tools"] = serde_json::to_value(&request.tools)
                    .map_err(|e| SessionError::Internal(e.into()))?;
            }

            let response = self.send_request(&body).await?;
            let mut sse = SseLines::new(response);

            let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
            let mut buffered: Vec<String> = Vec::new();

            while let Some(data) = sse.next_data().await? {
                if data == "[DONE]" {
                    break;
                }
                let chunk: ChatChunk = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "Skipping unparseable completion chunk");
                        continue;
                    }
                };
                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };

                if let Some(deltas) = choice.delta.tool_calls {
                    for delta in deltas {
                        apply_tool_call_delta(&mut pending, delta);
                    }
                }
                if let Some(content) = choice.delta.content {
                    if content.is_empty() {
                        continue;
                    }
                    if tools_declared {
                        buffered.push(content);
                    } else {
                        yield content;
                    }
                }
            }

            if tools_declared && !pending.is_empty() {
                let dispatch = request
                    .dispatch
                    .clone()
                    .ok_or_else(|| SessionError::Internal(anyhow::anyhow!(
                        "tool calls without a dispatcher"
                    )))?;

                // A call is complete only once the stream has ended; execute
                // in arrival order so side effects stay deterministic.
                let calls: Vec<ApiToolCall> = pending
                    .into_values()
                    .map(|p| ApiToolCall {
                        id: p.id,
                        call_type: "function",
                        function: ApiFunctionCall {
                            name: p.name,
                            arguments: p.arguments,
                        },
                    })
                    .collect();
                info!(
                    character = request.character_name,
                    count = calls.len(),
                    "Executing tool calls"
                );

                let content = if buffered.is_empty() {
                    None
                } else {
                    Some(buffered.concat())
                };
                request
                    .messages
                    .push(ApiMessage::assistant_with_tools(content, calls.clone()));

                for call in &calls {
                    let result = execute_tool(
                        &dispatch,
                        &call.function.name,
                        &call.function.arguments,
                        &request.validators,
                        &request.character_name,
                    )
                    .await
                    .map_err(|e| SessionError::Internal(anyhow::anyhow!(e)))?;
                    debug!(tool = call.function.name, "Tool result folded into turn");
                    request
                        .messages
                        .push(ApiMessage::tool_result(call.id.clone(), result));
                }

                // Re-query with tool declarations omitted: exactly one tool
                // round trip per turn, never more.
                let body = serde_json::json!({
                    "model": model,
                    "messages": request.messages,
                    "stream": true,
                    "temperature": self.temperature,
                });
                let response = self.send_request(&body).await?;
                let mut sse = SseLines::new(response);
                while let Some(data) = sse.next_data().await? {
                    if data == "[DONE]" {
                        break;
                    }
                    let chunk: ChatChunk = match serde_json::from_str(&data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(error = %e, "Skipping unparseable completion chunk");
                            continue;
                        }
                    };
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                }
            } else if tools_declared && !buffered.is_empty() {
                // Tools declared, none invoked: flush the held-back content.
                for piece in buffered {
                    yield piece;
                }
            }
        }
    }
}

fn classify_request_error(e: reqwest::Error) -> SessionError {
    if let Some(status) = e.status() {
        if status == http::StatusCode::TOO_MANY_REQUESTS
            || status == http::StatusCode::SERVICE_UNAVAILABLE
        {
            return SessionError::ServiceAtCapacity(Service::Chat);
        }
        return SessionError::Upstream(format!("chat request failed with status {status}"));
    }
    if e.is_timeout() || e.is_connect() {
        return SessionError::ServiceTimeout(Service::Chat);
    }
    SessionError::Upstream(format!("chat request failed: {e}"))
}

/// Incremental SSE `data:` line extractor over a byte stream.
struct SseLines {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
}

impl SseLines {
    fn new(response: reqwest::Response) -> Self {
        SseLines {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    async fn next_data(&mut self) -> SessionResult<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim();
                if let Some(data) = line.strip_prefix("data:") {
                    return Ok(Some(data.trim().to_string()));
                }
                continue;
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(e)) => {
                    return Err(SessionError::Upstream(format!("chat stream error: {e}")));
                }
                None => return Ok(None),
            }
        }
    }
}
