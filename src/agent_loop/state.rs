//! Loop states and the transition function.

use super::types::RunStatus;
use crate::error::ParleyError;

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the model's next `ai` message.
    AwaitModel,
    /// Running the tool calls of the latest `ai` message.
    ExecuteTools,
    /// Terminal.
    Done(RunStatus),
}

/// What just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The model replied with this many tool calls.
    ModelReplied { tool_calls: usize },
    /// Every tool message of the batch is appended.
    ToolsFinished,
    /// No model calls left in the budget.
    IterationLimitReached,
}

impl LoopState {
    pub fn next(self, transition: Transition) -> Result<LoopState, ParleyError> {
        use LoopState::*;
        use Transition::*;
        match (self, transition) {
            (AwaitModel, ModelReplied { tool_calls: 0 }) => Ok(Done(RunStatus::Completed)),
            (AwaitModel, ModelReplied { .. }) => Ok(ExecuteTools),
            (AwaitModel, IterationLimitReached) => Ok(Done(RunStatus::Incomplete)),
            (ExecuteTools, ToolsFinished) => Ok(AwaitModel),
            (state, transition) => Err(ParleyError::InvalidState(format!(
                "{transition:?} is not valid in {state:?}"
            ))),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, LoopState::Done(_))
    }
}
