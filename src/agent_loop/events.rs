//! Events emitted while a run progresses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::RunStatus;
use crate::types::ToolCall;

/// Observable progress of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// A model call is about to be made.
    TurnStarted { iteration: usize },
    /// Incremental answer text, in arrival order.
    TextDelta { text: String },
    /// A tool call is about to run.
    ToolCallStarted { call: ToolCall },
    /// A tool call produced its `tool` message.
    ToolCallFinished {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
    /// The model replied; `tool_calls` is how many it requested.
    TurnFinished { iteration: usize, tool_calls: usize },
    /// The loop reached `Done`.
    RunFinished { status: RunStatus },
}

/// Callback receiving loop events. Must not block.
pub type LoopEventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct LoopEventEmitter {
    sink: Option<LoopEventSink>,
}

impl LoopEventEmitter {
    pub(crate) fn new(sink: Option<LoopEventSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, event: LoopEvent) {
        if let Some(sink) = &self.sink {
            (sink)(event);
        }
    }
}
