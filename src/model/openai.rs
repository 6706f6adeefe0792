//! OpenAI-compatible Chat Completions adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::ParleyError;
use crate::types::*;

use super::http::{bearer_headers, parse_sse_data, shared_client, status_to_error};
use super::{ModelCapability, ModelRequest, ModelResponse, ModelStream};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat Completions client for OpenAI or any compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiChatModel {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn build_request_body(&self, request: &ModelRequest, stream: bool) -> serde_json::Value {
        let messages = request.messages.iter().map(message_to_openai).collect::<Vec<_>>();

        let mut obj = serde_json::Map::new();
        obj.insert("model".into(), self.model.clone().into());
        obj.insert("messages".into(), messages.into());
        obj.insert("stream".into(), stream.into());
        if stream {
            obj.insert("stream_options".into(), serde_json::json!({"include_usage": true}));
        }

        let settings = &request.settings;
        if let Some(max) = settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(seed) = settings.seed {
            obj.insert("seed".into(), seed.into());
        }
        if let Some(ref user) = settings.user {
            obj.insert("user".into(), user.clone().into());
        }

        if !request.tools.is_empty() {
            let tool_defs: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        serde_json::Value::Object(obj)
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ParleyError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelCapability for OpenAiChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ParleyError> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, messages = request.messages.len(), "chat completion");

        let data: ChatResponse = self.post(&body).await?.json().await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ParleyError::Model("No choices in chat completion response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, parse_arguments(tc.function.arguments)))
            .collect::<Vec<_>>();

        Ok(ModelResponse {
            message: Message::ai_with_tool_calls(choice.message.content.unwrap_or_default(), tool_calls),
            usage: data.usage.map(Into::into).unwrap_or_default(),
            finish_reason: choice.finish_reason.as_deref().and_then(|s| s.parse().ok()),
        })
    }

    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelStream, ParleyError> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, messages = request.messages.len(), "streaming chat completion");

        let byte_stream = self.post(&body).await?.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut pending = PendingToolCalls::default();
            let mut finish: Option<FinishReason> = None;
            let mut completed = false;
            let mut usage: Option<Usage> = None;
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ParleyError::Network(e));
                        return;
                    }
                };
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if is_done_marker(&line) {
                        completed = true;
                        continue;
                    }
                    let Some(data) = parse_sse_data(&line) else {
                        continue;
                    };

                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
                        continue;
                    };
                    if let Some(error) = chunk.error {
                        yield Err(ParleyError::Stream(stream_error_message(&error)));
                        return;
                    }

                    if let Some(u) = chunk.usage {
                        usage = Some(u.into());
                    }
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            yield Ok(ModelStreamDelta::text(text));
                        }
                        for delta in choice.delta.tool_calls.unwrap_or_default() {
                            pending.absorb(delta);
                        }
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            finish = reason.parse().ok();
                            completed = true;
                        }
                    }
                }
            }

            // EOF without [DONE] or a finish reason means the connection dropped.
            if !completed {
                yield Err(ParleyError::Stream("stream ended before completion".into()));
                return;
            }
            for call in pending.finish() {
                yield Ok(ModelStreamDelta::tool_call(call));
            }
            yield Ok(ModelStreamDelta::done(finish, usage));
        };

        Ok(Box::pin(stream))
    }
}

/// Raw body bytes not yet split into lines. Only complete lines are decoded,
/// so a UTF-8 sequence split across network chunks stays intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.bytes.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

fn is_done_marker(line: &str) -> bool {
    line.strip_prefix("data:").is_some_and(|data| data.trim() == "[DONE]")
}

/// Tool call fragments keyed by their `index` in the choice.
#[derive(Default)]
struct PendingToolCalls {
    calls: BTreeMap<u32, PendingCall>,
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCalls {
    fn absorb(&mut self, delta: StreamToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            entry.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .map(|c| ToolCall::new(c.id, c.name, parse_arguments(c.arguments)))
            .collect()
    }
}

/// Decode the JSON-encoded argument string; keep undecodable input verbatim so
/// schema validation can report it.
fn parse_arguments(raw: String) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

fn stream_error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn message_to_openai(msg: &Message) -> serde_json::Value {
    match msg.role {
        MessageRole::System => serde_json::json!({ "role": "system", "content": msg.content }),
        MessageRole::Human => serde_json::json!({ "role": "user", "content": msg.content }),
        MessageRole::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
        MessageRole::Ai if msg.has_tool_calls() => {
            let calls: Vec<serde_json::Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(msg.content.clone())
            };
            serde_json::json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        MessageRole::Ai => serde_json::json!({ "role": "assistant", "content": msg.content }),
    }
}

// Chat Completions wire types (internal)

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
