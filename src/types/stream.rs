//! Streaming types.

use serde::{Deserialize, Serialize};

use super::generation::FinishReason;
use super::message::ToolCall;
use super::usage::Usage;

/// A delta emitted by a streaming model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelStreamDelta {
    /// The incremental text chunk.
    pub text: String,
    /// Event type.
    pub event_type: StreamEventType,
    /// Completed tool call (only on `ToolCallComplete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    /// Finish reason (only on the final delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Usage (typically only on the final delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ModelStreamDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            event_type: StreamEventType::TextDelta,
            tool_call: None,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            text: String::new(),
            event_type: StreamEventType::ToolCallComplete,
            tool_call: Some(call),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn done(finish_reason: Option<FinishReason>, usage: Option<Usage>) -> Self {
        Self {
            text: String::new(),
            event_type: StreamEventType::Done,
            tool_call: None,
            finish_reason,
            usage,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            event_type: StreamEventType::Error,
            tool_call: None,
            finish_reason: Some(FinishReason::Error),
            usage: None,
        }
    }
}

/// Type of stream event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    /// Incremental text content.
    TextDelta,
    /// A tool call whose name and arguments are fully known.
    ToolCallComplete,
    /// Stream finished.
    Done,
    /// Error during stream.
    Error,
}
