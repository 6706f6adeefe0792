//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A message in a conversation history.
///
/// Histories are append-only; a message is never mutated once it has been
/// pushed onto one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool calls requested by the model. Only populated on `ai` messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Originating call id. Only present on `tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Whether a `tool` message reports a failed invocation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            timestamp: Some(Utc::now()),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    /// Create a human (caller) message.
    pub fn human(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Human, text)
    }

    /// Create a final ai message with no tool calls.
    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Ai, text)
    }

    /// Create an ai message requesting tool calls.
    pub fn ai_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(MessageRole::Ai, text)
        }
    }

    /// Create a successful tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    /// Create a tool message describing a failed invocation.
    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::tool_result(tool_call_id, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Conversation role.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    System,
    Human,
    Ai,
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Drop a trailing turn whose tool calls are not all answered.
///
/// Walks back to the last `ai` message carrying tool calls and, if the
/// `tool` messages after it do not answer every call, truncates the history
/// at that `ai` message. Returns the number of messages removed.
pub fn trim_incomplete_tool_turn(history: &mut Vec<Message>) -> usize {
    let Some(ai_index) = history
        .iter()
        .rposition(|message| message.role == MessageRole::Ai && message.has_tool_calls())
    else {
        return 0;
    };
    let answered = history[ai_index + 1..]
        .iter()
        .filter(|message| message.role == MessageRole::Tool)
        .filter_map(|message| message.tool_call_id.as_deref())
        .collect::<Vec<_>>();
    let complete = history[ai_index]
        .tool_calls
        .iter()
        .all(|call| answered.contains(&call.id.as_str()));
    if complete {
        return 0;
    }
    let removed = history.len() - ai_index;
    history.truncate(ai_index);
    removed
}
