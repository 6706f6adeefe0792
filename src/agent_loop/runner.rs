//! The agent loop: alternate between the model and the tools it asks for.

use std::collections::HashSet;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{LoopEvent, LoopEventEmitter, LoopEventSink};
use super::state::{LoopState, Transition};
use super::tool_phase::{run_tool_phase, ToolPhaseArgs};
use super::types::{AgentConfig, RunFailure, RunOutcome};
use crate::error::ParleyError;
use crate::model::{ModelRequest, ModelResponse};
use crate::types::{Message, MessageRole, StreamEventType, Usage};
use crate::util::with_timeout;

/// Whether model replies are requested whole or incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelMode {
    Whole,
    Incremental,
}

/// Drives one conversation turn to `Done`.
///
/// The loop only ever sees the tools in `config.allowed_tools`; it performs
/// no authorization of its own.
#[derive(Clone)]
pub struct AgentLoop {
    config: AgentConfig,
    emitter: LoopEventEmitter,
    session_id: Option<String>,
}

impl AgentLoop {
    pub fn new(config: AgentConfig) -> Self {
        let config = AgentConfig {
            limits: config.limits.normalized(),
            ..config
        };
        Self {
            config,
            emitter: LoopEventEmitter::default(),
            session_id: None,
        }
    }

    /// Receive [`LoopEvent`]s as the run progresses.
    pub fn with_events(mut self, sink: LoopEventSink) -> Self {
        self.emitter = LoopEventEmitter::new(Some(sink));
        self
    }

    /// Tag logs and tool contexts with a session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until the model gives a final answer or the iteration limit hits.
    ///
    /// `prior` is the persisted history; `input` holds the messages this turn
    /// adds (normally one `human` message).
    pub async fn run(
        &self,
        prior: &[Message],
        input: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        self.drive(prior, input, cancel, ModelMode::Whole).await
    }

    /// Like [`run`](Self::run), but streams model text as
    /// [`LoopEvent::TextDelta`] events while it arrives.
    pub async fn run_streaming(
        &self,
        prior: &[Message],
        input: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        self.drive(prior, input, cancel, ModelMode::Incremental).await
    }

    async fn drive(
        &self,
        prior: &[Message],
        input: Vec<Message>,
        cancel: &CancellationToken,
        mode: ModelMode,
    ) -> Result<RunOutcome, RunFailure> {
        let session_id = self.session_id.as_deref().unwrap_or("-");
        let limits = &self.config.limits;
        let mut messages = self.with_system_prompt(prior, input);
        let mut state = LoopState::AwaitModel;
        let mut iterations = 0usize;
        let mut usage = Usage::default();
        let mut answer = String::new();

        debug!(session_id, prior = prior.len(), "run started");

        let status = loop {
            if cancel.is_cancelled() {
                return Err(RunFailure::new(ParleyError::Canceled, messages));
            }
            let transition = match state {
                LoopState::Done(status) => break status,
                LoopState::AwaitModel if iterations >= limits.max_iterations => {
                    warn!(session_id, iterations, "iteration limit reached");
                    Transition::IterationLimitReached
                }
                LoopState::AwaitModel => {
                    iterations += 1;
                    self.emitter.emit(LoopEvent::TurnStarted { iteration: iterations });
                    let response = match self.call_model(prior, &messages, cancel, mode).await {
                        Ok(response) => response,
                        Err(error) => {
                            warn!(session_id, iteration = iterations, %error, "model call failed");
                            return Err(RunFailure::new(error, messages));
                        }
                    };
                    usage.merge(&response.usage);
                    let tool_calls = response.message.tool_calls.len();
                    answer.clone_from(&response.message.content);
                    messages.push(response.message);
                    self.emitter.emit(LoopEvent::TurnFinished {
                        iteration: iterations,
                        tool_calls,
                    });
                    debug!(session_id, iteration = iterations, tool_calls, "model replied");
                    Transition::ModelReplied { tool_calls }
                }
                LoopState::ExecuteTools => {
                    let calls = messages
                        .last()
                        .map(|m| m.tool_calls.clone())
                        .unwrap_or_default();
                    let results = run_tool_phase(ToolPhaseArgs {
                        allowed: &self.config.allowed_tools,
                        calls: &calls,
                        limits,
                        session_id: self.session_id.as_deref(),
                        emitter: &self.emitter,
                        cancel,
                    })
                    .await;
                    let results = match results {
                        Ok(results) => results,
                        Err(error) => return Err(RunFailure::new(error, messages)),
                    };
                    if cancel.is_cancelled() {
                        return Err(RunFailure::new(ParleyError::Canceled, messages));
                    }
                    messages.extend(results);
                    Transition::ToolsFinished
                }
            };
            state = match state.next(transition) {
                Ok(next) => next,
                Err(error) => return Err(RunFailure::new(error, messages)),
            };
        };

        self.emitter.emit(LoopEvent::RunFinished { status });
        info!(session_id, iterations, %status, "run finished");

        Ok(RunOutcome {
            status,
            answer,
            messages,
            usage,
            iterations,
        })
    }

    fn with_system_prompt(&self, prior: &[Message], input: Vec<Message>) -> Vec<Message> {
        let has_system = input.first().map(|m| m.role) == Some(MessageRole::System);
        match &self.config.system_prompt {
            Some(prompt) if prior.is_empty() && !has_system => {
                let mut messages = Vec::with_capacity(input.len() + 1);
                messages.push(Message::system(prompt.clone()));
                messages.extend(input);
                messages
            }
            _ => input,
        }
    }

    async fn call_model(
        &self,
        prior: &[Message],
        messages: &[Message],
        cancel: &CancellationToken,
        mode: ModelMode,
    ) -> Result<ModelResponse, ParleyError> {
        let request = ModelRequest {
            messages: prior.iter().chain(messages).cloned().collect(),
            tools: self.config.allowed_tools.definitions(),
            settings: self.config.settings.clone(),
        };
        let model = self.config.model.as_ref();
        let timeout = self.config.limits.model_timeout();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ParleyError::Canceled),
            response = with_timeout(timeout, async {
                match mode {
                    ModelMode::Whole => model.invoke(&request).await,
                    ModelMode::Incremental => self.collect_stream(&request).await,
                }
            }) => response?,
        };

        check_reply(response)
    }

    /// Consume a model stream, forwarding text as it arrives.
    async fn collect_stream(&self, request: &ModelRequest) -> Result<ModelResponse, ParleyError> {
        let mut stream = self.config.model.invoke_stream(request).await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = Usage::default();
        let mut finish_reason = None;
        let mut done = false;

        while let Some(delta) = stream.next().await {
            let delta = delta?;
            match delta.event_type {
                StreamEventType::TextDelta => {
                    if !delta.text.is_empty() {
                        text.push_str(&delta.text);
                        self.emitter.emit(LoopEvent::TextDelta { text: delta.text });
                    }
                }
                StreamEventType::ToolCallComplete => tool_calls.extend(delta.tool_call),
                StreamEventType::Error => return Err(ParleyError::Stream(delta.text)),
                StreamEventType::Done => {
                    if let Some(u) = delta.usage {
                        usage = u;
                    }
                    finish_reason = delta.finish_reason;
                    done = true;
                    break;
                }
            }
        }
        if !done {
            return Err(ParleyError::Stream(
                "model stream ended without a done event".into(),
            ));
        }

        Ok(ModelResponse {
            message: Message::ai_with_tool_calls(text, tool_calls),
            usage,
            finish_reason,
        })
    }
}

/// Enforce the reply contract: an `ai` message with distinct, non-empty call ids.
fn check_reply(mut response: ModelResponse) -> Result<ModelResponse, ParleyError> {
    if response.message.role != MessageRole::Ai {
        return Err(ParleyError::Model(format!(
            "model replied with a {} message",
            response.message.role
        )));
    }
    let mut seen = HashSet::new();
    for call in &mut response.message.tool_calls {
        if call.id.is_empty() {
            call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
        if !seen.insert(call.id.clone()) {
            return Err(ParleyError::Model(format!("duplicate tool call id '{}'", call.id)));
        }
    }
    Ok(response)
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("config", &self.config)
            .field("session_id", &self.session_id)
            .finish()
    }
}
