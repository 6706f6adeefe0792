//! The model capability consumed by the agent loop, plus adapters.
//!
//! The loop treats the model as opaque: given the history and the tools the
//! caller may use, it returns exactly one `ai` message, optionally carrying
//! tool calls. Streaming is an optional refinement; the default
//! [`ModelCapability::invoke_stream`] replays [`ModelCapability::invoke`].

pub mod http;

#[cfg(feature = "openai")]
pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ParleyError;
use crate::types::{FinishReason, GenerationSettings, Message, ModelStreamDelta, Usage};

pub use crate::tools::ToolDefinition;

/// A single model call.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// Full history, oldest first.
    pub messages: Vec<Message>,
    /// Tools the model may call. Never wider than the caller's allow-list.
    pub tools: Vec<ToolDefinition>,
    pub settings: GenerationSettings,
}

/// The model's reply to one [`ModelRequest`].
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// Always an `ai` message.
    pub message: Message,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}

impl ModelResponse {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: Usage::default(),
            finish_reason: None,
        }
    }
}

/// Stream of model deltas.
pub type ModelStream = BoxStream<'static, Result<ModelStreamDelta, ParleyError>>;

/// A language model the agent loop can call.
#[async_trait]
pub trait ModelCapability: Send + Sync {
    /// Identifier used in logs.
    fn model_id(&self) -> &str;

    /// Produce one `ai` message for the request.
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ParleyError>;

    /// Produce the reply incrementally.
    ///
    /// Implementations must emit each tool call as a complete
    /// `ToolCallComplete` delta and end with a `Done` delta.
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelStream, ParleyError> {
        let response = self.invoke(request).await?;
        let mut deltas = Vec::with_capacity(response.message.tool_calls.len() + 2);
        if !response.message.content.is_empty() {
            deltas.push(Ok(ModelStreamDelta::text(response.message.content)));
        }
        deltas.extend(
            response
                .message
                .tool_calls
                .into_iter()
                .map(|call| Ok(ModelStreamDelta::tool_call(call))),
        );
        deltas.push(Ok(ModelStreamDelta::done(
            response.finish_reason,
            Some(response.usage),
        )));
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Build the configured model adapter.
#[cfg(feature = "openai")]
pub fn create_model(
    config: &crate::config::ModelConfig,
) -> Result<std::sync::Arc<dyn ModelCapability>, ParleyError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| ParleyError::Authentication("Missing OPENAI_API_KEY".into()))?;
    Ok(std::sync::Arc::new(openai::OpenAiChatModel::new(
        config.name.clone(),
        api_key,
        config.base_url.clone(),
    )))
}
