//! Core run types for the agent loop.

use std::sync::Arc;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use super::limits::LoopLimits;
use crate::error::ParleyError;
use crate::model::ModelCapability;
use crate::policy::AllowedTools;
use crate::types::{GenerationSettings, Message, Usage};

/// How a run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    /// The model produced a final answer.
    Completed,
    /// The iteration limit was reached before a final answer.
    Incomplete,
}

/// Everything one run needs. Built per authorized session and never mutated
/// during the run.
#[derive(Builder, Clone)]
pub struct AgentConfig {
    pub model: Arc<dyn ModelCapability>,
    #[builder(default)]
    pub allowed_tools: AllowedTools,
    /// Prepended to the history of sessions that have none yet.
    #[builder(into)]
    pub system_prompt: Option<String>,
    #[builder(default)]
    pub limits: LoopLimits,
    #[builder(default)]
    pub settings: GenerationSettings,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model.model_id())
            .field("allowed_tools", &self.allowed_tools)
            .field("system_prompt", &self.system_prompt)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Result of a run that reached `Done`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Content of the last `ai` message. May be partial when incomplete.
    pub answer: String,
    /// Messages added by this run, input included, in append order.
    pub messages: Vec<Message>,
    pub usage: Usage,
    /// Model calls made.
    pub iterations: usize,
}

/// A run that stopped before `Done`.
///
/// `partial` holds the messages appended so far. It may end with an `ai`
/// tool-call message whose results are missing; trim it before persisting.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: ParleyError,
    pub partial: Vec<Message>,
}

impl RunFailure {
    pub fn new(error: ParleyError, partial: Vec<Message>) -> Self {
        Self { error, partial }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.error, ParleyError::Canceled)
    }
}

impl From<RunFailure> for ParleyError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}
