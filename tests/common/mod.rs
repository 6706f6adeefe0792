//! Shared test helpers: a scripted model and a handful of fake tools.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use parley::checkpoint::MemoryCheckpointStore;
use parley::error::ParleyError;
use parley::model::{ModelCapability, ModelRequest, ModelResponse, ModelStream};
use parley::policy::{AuthorizationFilter, ToolPolicy};
use parley::service::ChatService;
use parley::tools::{AgentTool, CapabilityRegistry, ToolParameters};
use parley::types::{FinishReason, Message, ModelStreamDelta, ToolCall, Usage};

/// One scripted model turn.
pub enum Step {
    Reply(Message),
    Fail(ParleyError),
    /// Never answers; only a timeout or cancel ends the call.
    Hang,
}

/// A model that replays a fixed script and records every request.
pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn replies(messages: Vec<Message>) -> Arc<Self> {
        Self::new(messages.into_iter().map(Step::Reply).collect())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn next(&self, request: &ModelRequest) -> Result<ModelResponse, ParleyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(message)) => Ok(ModelResponse {
                message,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                },
                finish_reason: Some(FinishReason::Stop),
            }),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ParleyError::Model("hang step woke up".into()))
            }
            None => Err(ParleyError::Model("script exhausted".into())),
        }
    }
}

#[async_trait]
impl ModelCapability for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ParleyError> {
        self.next(request).await
    }

    /// Streams the reply word by word, then its tool calls.
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<ModelStream, ParleyError> {
        let response = self.next(request).await?;
        let mut deltas: Vec<Result<ModelStreamDelta, ParleyError>> = response
            .message
            .content
            .split_inclusive(' ')
            .map(|word| Ok(ModelStreamDelta::text(word)))
            .collect();
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
        Ok(Box::pin(stream::iter(deltas)))
    }
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

pub fn asks_for(calls: Vec<ToolCall>) -> Message {
    Message::ai_with_tool_calls("", calls)
}

/// Counts how often a fake tool actually ran.
#[derive(Debug, Clone, Default)]
pub struct Invocations(Arc<AtomicUsize>);

impl Invocations {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn price_tool(hits: Invocations) -> AgentTool {
    AgentTool::new(
        "get_price",
        "Look up the USD price of a coin",
        ToolParameters::object()
            .string("slug", "Coin slug, e.g. bitcoin", true)
            .build(),
        move |args, _ctx| {
            let hits = hits.clone();
            async move {
                hits.hit();
                let slug = args.get_str("slug")?;
                Ok(format!("{slug} price: 65000 USD"))
            }
        },
    )
}

#[derive(serde::Deserialize)]
struct SearchArgs {
    query: String,
}

pub fn web_search_tool(hits: Invocations) -> AgentTool {
    AgentTool::new(
        "web_search",
        "Search the web",
        ToolParameters::object()
            .string("query", "Search terms", true)
            .build(),
        move |args, _ctx| {
            let hits = hits.clone();
            async move {
                hits.hit();
                let search: SearchArgs = args.parse()?;
                Ok(format!("no results for '{}'", search.query))
            }
        },
    )
}

pub fn failing_tool() -> AgentTool {
    AgentTool::new(
        "rag_qa",
        "Answer from the document index",
        ToolParameters::empty(),
        |_args, _ctx| async move {
            Err(ParleyError::ToolExecution {
                tool_name: "rag_qa".into(),
                message: "index offline".into(),
            })
        },
    )
}

pub fn slow_tool() -> AgentTool {
    AgentTool::new(
        "get_news",
        "Latest headlines",
        ToolParameters::empty(),
        |_args, ctx| async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(ParleyError::Canceled),
                _ = tokio::time::sleep(Duration::from_secs(600)) => Ok("late news".to_string()),
            }
        },
    )
}

/// Registry of every fake tool, with hit counters for get_price and web_search.
pub fn registry() -> (Arc<CapabilityRegistry>, Invocations, Invocations) {
    let price_hits = Invocations::default();
    let search_hits = Invocations::default();
    let mut registry = CapabilityRegistry::new();
    registry.register(price_tool(price_hits.clone())).unwrap();
    registry.register(web_search_tool(search_hits.clone())).unwrap();
    registry.register(failing_tool()).unwrap();
    registry.register(slow_tool()).unwrap();
    (Arc::new(registry), price_hits, search_hits)
}

/// Service over an in-memory store with the default role policy.
pub fn service(model: Arc<ScriptedModel>, registry: Arc<CapabilityRegistry>) -> ChatService {
    ChatService::new(
        model,
        AuthorizationFilter::new(registry, ToolPolicy::default()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .with_system_prompt("You are a helpful assistant")
}
