//! Caller-facing chat surface: one request in, one answer (or stream) out.
//!
//! For every request the service resolves the session, narrows the tool
//! catalog to the caller's role, runs the agent loop and persists the result.
//! A failed model call commits nothing; a canceled run keeps the consistent
//! prefix of its history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent_loop::{AgentConfig, AgentLoop, LoopEvent, LoopLimits, RunFailure, RunStatus};
use crate::checkpoint::CheckpointStore;
use crate::config::ParleyConfig;
use crate::error::ParleyError;
use crate::model::ModelCapability;
use crate::policy::{AuthorizationFilter, CallerRole};
use crate::session::{Session, SessionManager};
use crate::stream::{response_channel, ResponseStream};
use crate::tools::CapabilityRegistry;
use crate::types::{trim_incomplete_tool_turn, GenerationSettings, Message};

/// Who is asking, as established by the identity system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub identity: String,
    pub role: CallerRole,
}

impl Caller {
    pub fn new(identity: impl Into<String>, role: impl Into<CallerRole>) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    /// Continue this session; a fresh id is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub session_id: String,
    pub status: RunStatus,
}

/// Wires registry, policy, model and checkpoint store together.
#[derive(Clone)]
pub struct ChatService {
    model: Arc<dyn ModelCapability>,
    filter: AuthorizationFilter,
    sessions: SessionManager,
    system_prompt: Option<String>,
    limits: LoopLimits,
    settings: GenerationSettings,
}

impl ChatService {
    pub fn new(
        model: Arc<dyn ModelCapability>,
        filter: AuthorizationFilter,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            model,
            filter,
            sessions: SessionManager::new(store),
            system_prompt: None,
            limits: LoopLimits::default(),
            settings: GenerationSettings::default(),
        }
    }

    /// Build from configuration with an explicit model.
    pub fn from_config_with_model(
        config: &ParleyConfig,
        registry: Arc<CapabilityRegistry>,
        model: Arc<dyn ModelCapability>,
    ) -> Result<Self, ParleyError> {
        config.validate()?;
        let filter = AuthorizationFilter::new(registry, config.policy.clone());
        Ok(Self::new(model, filter, config.checkpoint.open())
            .with_system_prompt(config.system_prompt.clone())
            .with_limits(config.limits)
            .with_settings(config.model.settings.clone()))
    }

    /// Build from configuration using the OpenAI-compatible adapter.
    #[cfg(feature = "openai")]
    pub fn from_config(
        config: &ParleyConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, ParleyError> {
        let model = crate::model::create_model(&config.model)?;
        Self::from_config_with_model(config, registry, model)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Answer one query.
    pub async fn chat(&self, caller: &Caller, request: ChatRequest) -> Result<ChatResponse, ParleyError> {
        self.chat_with_cancel(caller, request, &CancellationToken::new())
            .await
    }

    /// Like [`chat`](Self::chat), stopping early when `cancel` fires.
    pub async fn chat_with_cancel(
        &self,
        caller: &Caller,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ParleyError> {
        let query = validate_query(&request)?;
        let session = self.sessions.begin(request.session_id.as_deref()).await?;
        info!(
            session_id = session.id(),
            caller = %caller.identity,
            role = %caller.role,
            "chat request"
        );

        let agent = self.agent_for(caller, session.id());
        let result = agent
            .run(session.history(), vec![Message::human(query)], cancel)
            .await;

        match result {
            Ok(outcome) => {
                let session_id = session.id().to_string();
                self.sessions.commit(session, outcome.messages).await?;
                Ok(ChatResponse {
                    answer: outcome.answer,
                    session_id,
                    status: outcome.status,
                })
            }
            Err(failure) => Err(settle_failure(&self.sessions, session, failure).await),
        }
    }

    /// Answer one query as a stream of text fragments.
    ///
    /// Session resolution happens before this returns, so checkpoint failures
    /// surface here. Later failures arrive as a terminal
    /// [`StreamChunk::Error`](crate::stream::StreamChunk::Error).
    pub async fn chat_stream(
        &self,
        caller: &Caller,
        request: ChatRequest,
    ) -> Result<ResponseStream, ParleyError> {
        let query = validate_query(&request)?.to_string();
        let session = self.sessions.begin(request.session_id.as_deref()).await?;
        info!(
            session_id = session.id(),
            caller = %caller.identity,
            role = %caller.role,
            "streaming chat request"
        );

        let cancel = CancellationToken::new();
        let (emitter, stream) = response_channel(session.id(), cancel.clone());

        let text_emitter = emitter.clone();
        let agent = self
            .agent_for(caller, session.id())
            .with_events(Arc::new(move |event| {
                if let LoopEvent::TextDelta { text } = event {
                    text_emitter.text(text);
                }
            }));
        let sessions = self.sessions.clone();

        tokio::spawn(async move {
            let result = agent
                .run_streaming(session.history(), vec![Message::human(query)], &cancel)
                .await;
            drop(agent);
            match result {
                Ok(outcome) => {
                    let session_id = session.id().to_string();
                    match sessions.commit(session, outcome.messages).await {
                        Ok(_) => emitter.done(session_id, outcome.status),
                        Err(error) => emitter.error(error.to_string()),
                    }
                }
                Err(failure) => {
                    let error = settle_failure(&sessions, session, failure).await;
                    emitter.error(error.to_string());
                }
            }
        });

        Ok(stream)
    }

    /// Persisted history of a session.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, ParleyError> {
        self.sessions.load(session_id).await
    }

    /// Release process-wide resources. Later requests fail.
    pub async fn shutdown(&self) -> Result<(), ParleyError> {
        info!("shutting down chat service");
        self.sessions.store().close().await
    }

    fn agent_for(&self, caller: &Caller, session_id: &str) -> AgentLoop {
        let config = AgentConfig::builder()
            .model(Arc::clone(&self.model))
            .allowed_tools(self.filter.allowed_tools(&caller.role))
            .maybe_system_prompt(self.system_prompt.clone())
            .limits(self.limits)
            .settings(self.settings.clone())
            .build();
        AgentLoop::new(config).with_session_id(session_id)
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("model", &self.model.model_id())
            .field("tools", &self.filter.registry().names())
            .field("limits", &self.limits)
            .finish()
    }
}

fn validate_query(request: &ChatRequest) -> Result<&str, ParleyError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ParleyError::InvalidArgument("query is empty".into()));
    }
    Ok(query)
}

/// Decide what a failed run leaves behind and return its error.
///
/// Canceled runs keep every fully answered turn; anything else commits
/// nothing so a retry starts from the last commit.
async fn settle_failure(
    sessions: &SessionManager,
    session: Session,
    failure: RunFailure,
) -> ParleyError {
    let RunFailure { error, mut partial } = failure;
    if !matches!(error, ParleyError::Canceled) {
        warn!(session_id = session.id(), %error, "run failed; nothing committed");
        sessions.abandon(session);
        return error;
    }

    let trimmed = trim_incomplete_tool_turn(&mut partial);
    info!(
        session_id = session.id(),
        kept = partial.len(),
        trimmed,
        "run canceled"
    );
    if partial.is_empty() {
        sessions.abandon(session);
    } else if let Err(commit_error) = sessions.commit(session, partial).await {
        warn!(error = %commit_error, "could not persist canceled run");
    }
    error
}
