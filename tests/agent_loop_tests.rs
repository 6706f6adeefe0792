//! Agent loop behaviour against a scripted model.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use futures::stream;

use common::{asks_for, call, registry, ScriptedModel, Step};
use parley::agent_loop::{AgentConfig, AgentLoop, LoopEvent, LoopLimits, RunStatus};
use parley::error::ParleyError;
use parley::model::{ModelCapability, ModelRequest, ModelResponse, ModelStream};
use parley::policy::{AuthorizationFilter, CallerRole, ToolPolicy};
use parley::tools::{AgentTool, CapabilityRegistry, ToolParameters};
use parley::types::{trim_incomplete_tool_turn, Message, MessageRole, ModelStreamDelta};

fn agent(model: &Arc<ScriptedModel>, role: CallerRole, limits: LoopLimits) -> AgentLoop {
    let (registry, _, _) = registry();
    let allowed = AuthorizationFilter::new(registry, ToolPolicy::default()).allowed_tools(&role);
    let config = AgentConfig::builder()
        .model(model.clone())
        .allowed_tools(allowed)
        .limits(limits)
        .build();
    AgentLoop::new(config)
}

fn roles(messages: &[Message]) -> Vec<MessageRole> {
    messages.iter().map(|m| m.role).collect()
}

#[tokio::test]
async fn price_lookup_runs_the_tool_then_answers() {
    let model = ScriptedModel::replies(vec![
        asks_for(vec![call("c1", "get_price", json!({ "slug": "bitcoin" }))]),
        Message::ai("Bitcoin is trading at 65000 USD."),
    ]);
    let (registry, price_hits, _) = registry();
    let allowed =
        AuthorizationFilter::new(registry, ToolPolicy::default()).allowed_tools(&CallerRole::User);
    let agent = AgentLoop::new(
        AgentConfig::builder()
            .model(model.clone())
            .allowed_tools(allowed)
            .system_prompt("You are a helpful assistant")
            .build(),
    );

    let outcome = agent
        .run(
            &[],
            vec![Message::human("What is the price of bitcoin?")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.answer, "Bitcoin is trading at 65000 USD.");
    assert_eq!(
        roles(&outcome.messages),
        vec![
            MessageRole::System,
            MessageRole::Human,
            MessageRole::Ai,
            MessageRole::Tool,
            MessageRole::Ai,
        ]
    );
    let tool_message = &outcome.messages[3];
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tool_message.content, "bitcoin price: 65000 USD");
    assert!(!tool_message.is_error);
    assert_eq!(price_hits.count(), 1);
    assert_eq!(outcome.usage.total_tokens, 30);
}

#[tokio::test]
async fn model_only_sees_the_callers_tools() {
    let model = ScriptedModel::replies(vec![Message::ai("hello")]);
    agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap();

    let requests = model.requests();
    let offered: Vec<_> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(offered, vec!["get_price"]);
}

#[tokio::test]
async fn unknown_role_gets_no_tools() {
    let model = ScriptedModel::replies(vec![Message::ai("hello")]);
    agent(&model, CallerRole::from("auditor"), LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap();
    assert!(model.requests()[0].tools.is_empty());
}

#[tokio::test]
async fn iteration_limit_ends_the_run_incomplete() {
    let model = ScriptedModel::replies(
        (0..5)
            .map(|i| {
                Message::ai_with_tool_calls(
                    "checking",
                    vec![call(&format!("c{i}"), "get_price", json!({ "slug": "bitcoin" }))],
                )
            })
            .collect(),
    );
    let limits = LoopLimits {
        max_iterations: 3,
        ..LoopLimits::default()
    };

    let outcome = agent(&model, CallerRole::Admin, limits)
        .run(&[], vec![Message::human("loop forever")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Incomplete);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(model.call_count(), 3);
    assert_eq!(outcome.answer, "checking");
    // human + three (ai, tool) pairs
    assert_eq!(outcome.messages.len(), 7);
    assert_eq!(outcome.messages.last().map(|m| m.role), Some(MessageRole::Tool));
}

#[tokio::test]
async fn every_call_gets_one_message_in_declaration_order() {
    let model = ScriptedModel::replies(vec![
        asks_for(vec![
            call("a", "get_price", json!({ "slug": "bitcoin" })),
            call("b", "get_price", json!({ "slug": "ether" })),
            call("c", "launch_rocket", json!({})),
            call("d", "get_price", json!({})),
        ]),
        Message::ai("done"),
    ]);

    let outcome = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("prices")], &CancellationToken::new())
        .await
        .unwrap();

    let tool_messages: Vec<&Message> = outcome
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    let ids: Vec<_> = tool_messages
        .iter()
        .map(|m| m.tool_call_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);

    assert_eq!(tool_messages[0].content, "bitcoin price: 65000 USD");
    assert_eq!(tool_messages[1].content, "ether price: 65000 USD");
    assert!(tool_messages[2].is_error);
    assert_eq!(
        tool_messages[2].content,
        "Error: tool 'launch_rocket' is not available."
    );
    assert!(tool_messages[3].is_error);
    assert!(tool_messages[3]
        .content
        .starts_with("Error: invalid arguments for 'get_price'"));
}

fn sleeping_tool(name: &'static str, millis: u64) -> AgentTool {
    AgentTool::new(name, "Sleeps, then reports", ToolParameters::empty(), move |_args, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(format!("{name} finished"))
    })
}

#[tokio::test(start_paused = true)]
async fn tool_calls_run_concurrently_and_keep_declaration_order() {
    let mut registry = CapabilityRegistry::new();
    registry.register(sleeping_tool("slow_lookup", 300)).unwrap();
    registry.register(sleeping_tool("fast_lookup", 100)).unwrap();
    let allowed = AuthorizationFilter::new(Arc::new(registry), ToolPolicy::default())
        .allowed_tools(&CallerRole::Admin);

    let model = ScriptedModel::replies(vec![
        asks_for(vec![
            call("s", "slow_lookup", json!({})),
            call("f", "fast_lookup", json!({})),
        ]),
        Message::ai("both done"),
    ]);
    let config = AgentConfig::builder()
        .model(model.clone())
        .allowed_tools(allowed)
        .limits(LoopLimits::default())
        .build();

    let started = tokio::time::Instant::now();
    let outcome = AgentLoop::new(config)
        .run(&[], vec![Message::human("look both up")], &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let tool_messages: Vec<(&str, &str)> = outcome
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .map(|m| (m.tool_call_id.as_deref().unwrap(), m.content.as_str()))
        .collect();
    assert_eq!(
        tool_messages,
        vec![("s", "slow_lookup finished"), ("f", "fast_lookup finished")]
    );
    // Bounded by the slowest call, not the sum of both.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn tool_failure_becomes_an_error_message_and_the_loop_continues() {
    let model = ScriptedModel::replies(vec![
        asks_for(vec![call("r1", "rag_qa", json!({}))]),
        Message::ai("The index is unavailable right now."),
    ]);

    let outcome = agent(&model, CallerRole::Admin, LoopLimits::default())
        .run(&[], vec![Message::human("summarize the docs")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let tool_message = &outcome.messages[2];
    assert!(tool_message.is_error);
    assert!(tool_message.content.contains("index offline"));

    // The second model call saw the error.
    let second = &model.requests()[1];
    assert!(second.messages.iter().any(|m| m.is_error));
}

#[tokio::test(start_paused = true)]
async fn slow_tool_times_out_into_an_error_message() {
    let model = ScriptedModel::replies(vec![
        asks_for(vec![call("n1", "get_news", json!({}))]),
        Message::ai("No news yet."),
    ]);
    let limits = LoopLimits {
        tool_timeout_ms: 50,
        ..LoopLimits::default()
    };

    let outcome = agent(&model, CallerRole::Admin, limits)
        .run(&[], vec![Message::human("news?")], &CancellationToken::new())
        .await
        .unwrap();

    let tool_message = &outcome.messages[2];
    assert!(tool_message.is_error);
    assert_eq!(tool_message.content, "Error: tool 'get_news' timed out after 50ms.");
    assert_eq!(outcome.answer, "No news yet.");
}

#[tokio::test]
async fn strict_resolution_fails_the_run_without_running_tools() {
    let model = ScriptedModel::replies(vec![asks_for(vec![
        call("p1", "get_price", json!({ "slug": "bitcoin" })),
        call("w1", "web_search", json!({ "query": "bitcoin" })),
    ])]);
    let (registry, price_hits, search_hits) = registry();
    let allowed =
        AuthorizationFilter::new(registry, ToolPolicy::default()).allowed_tools(&CallerRole::User);
    let agent = AgentLoop::new(
        AgentConfig::builder()
            .model(model.clone())
            .allowed_tools(allowed)
            .limits(LoopLimits {
                strict_tool_resolution: true,
                ..LoopLimits::default()
            })
            .build(),
    );

    let failure = agent
        .run(&[], vec![Message::human("search")], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, ParleyError::UnauthorizedTool(ref name) if name == "web_search"));
    assert_eq!(price_hits.count(), 0);
    assert_eq!(search_hits.count(), 0);
    assert_eq!(roles(&failure.partial), vec![MessageRole::Human, MessageRole::Ai]);
}

#[tokio::test(start_paused = true)]
async fn model_timeout_is_terminal() {
    let model = ScriptedModel::new(vec![Step::Hang]);
    let limits = LoopLimits {
        model_timeout_ms: 100,
        ..LoopLimits::default()
    };

    let failure = agent(&model, CallerRole::User, limits)
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, ParleyError::Timeout(100)));
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn model_error_fails_the_run() {
    let model = ScriptedModel::new(vec![Step::Fail(ParleyError::api(500, "upstream down"))]);
    let failure = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ParleyError::Api { status: 500, .. }));
    assert!(failure.error.is_retryable());
}

#[tokio::test]
async fn non_ai_reply_is_rejected() {
    let model = ScriptedModel::replies(vec![Message::human("I am not the model")]);
    let failure = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ParleyError::Model(_)));
}

#[tokio::test]
async fn duplicate_call_ids_are_rejected_and_blank_ids_filled() {
    let model = ScriptedModel::replies(vec![asks_for(vec![
        call("same", "get_price", json!({ "slug": "a" })),
        call("same", "get_price", json!({ "slug": "b" })),
    ])]);
    let failure = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ParleyError::Model(_)));

    let model = ScriptedModel::replies(vec![
        asks_for(vec![call("", "get_price", json!({ "slug": "bitcoin" }))]),
        Message::ai("ok"),
    ]);
    let outcome = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &CancellationToken::new())
        .await
        .unwrap();
    let generated = &outcome.messages[1].tool_calls[0].id;
    assert!(generated.starts_with("call_"));
    assert_eq!(outcome.messages[2].tool_call_id.as_ref(), Some(generated));
}

#[tokio::test]
async fn streaming_forwards_text_in_order() {
    let model = ScriptedModel::replies(vec![
        asks_for(vec![call("c1", "get_price", json!({ "slug": "bitcoin" }))]),
        Message::ai("Bitcoin is 65000 USD"),
    ]);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let agent = agent(&model, CallerRole::User, LoopLimits::default()).with_events(Arc::new(
        move |event| sink_events.lock().unwrap().push(event),
    ));

    let outcome = agent
        .run_streaming(&[], vec![Message::human("price?")], &CancellationToken::new())
        .await
        .unwrap();

    let events = events.lock().unwrap();
    let text: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, vec!["Bitcoin ", "is ", "65000 ", "USD"]);
    assert_eq!(text.concat(), outcome.answer);
    assert_eq!(events.first(), Some(&LoopEvent::TurnStarted { iteration: 1 }));
    assert_eq!(
        events.last(),
        Some(&LoopEvent::RunFinished {
            status: RunStatus::Completed
        })
    );
    assert!(events.iter().any(|e| matches!(
        e,
        LoopEvent::ToolCallFinished { tool_call_id, is_error: false, .. } if tool_call_id == "c1"
    )));
}

/// Streams some text, then ends without a done event.
struct CutOffModel;

#[async_trait]
impl ModelCapability for CutOffModel {
    fn model_id(&self) -> &str {
        "cut-off"
    }

    async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse, ParleyError> {
        Err(ParleyError::Model("streaming only".into()))
    }

    async fn invoke_stream(&self, _request: &ModelRequest) -> Result<ModelStream, ParleyError> {
        let deltas: Vec<Result<ModelStreamDelta, ParleyError>> =
            vec![Ok(ModelStreamDelta::text("The price is 118,"))];
        Ok(Box::pin(stream::iter(deltas)))
    }
}

#[tokio::test]
async fn stream_without_done_fails_the_run() {
    let config = AgentConfig::builder()
        .model(Arc::new(CutOffModel))
        .limits(LoopLimits::default())
        .build();

    let failure = AgentLoop::new(config)
        .run_streaming(&[], vec![Message::human("price?")], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, ParleyError::Stream(_)));
    assert!(!failure.is_canceled());
}

#[tokio::test]
async fn canceled_before_start_never_calls_the_model() {
    let model = ScriptedModel::replies(vec![Message::ai("unused")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = agent(&model, CallerRole::User, LoopLimits::default())
        .run(&[], vec![Message::human("hi")], &cancel)
        .await
        .unwrap_err();

    assert!(failure.is_canceled());
    assert_eq!(model.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_tools_leaves_a_trimmable_partial() {
    let model = ScriptedModel::replies(vec![asks_for(vec![call("n1", "get_news", json!({}))])]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let failure = agent(&model, CallerRole::Admin, LoopLimits::default())
        .run(&[], vec![Message::human("news?")], &cancel)
        .await
        .unwrap_err();

    assert!(failure.is_canceled());
    let mut partial = failure.partial;
    assert_eq!(roles(&partial), vec![MessageRole::Human, MessageRole::Ai]);
    assert_eq!(trim_incomplete_tool_turn(&mut partial), 1);
    assert_eq!(roles(&partial), vec![MessageRole::Human]);
}

#[tokio::test]
async fn system_prompt_is_only_added_to_new_histories() {
    let model = ScriptedModel::replies(vec![Message::ai("again")]);
    let agent = AgentLoop::new(
        AgentConfig::builder()
            .model(model.clone())
            .system_prompt("You are a helpful assistant")
            .build(),
    );
    let prior = vec![
        Message::system("You are a helpful assistant"),
        Message::human("hi"),
        Message::ai("hello"),
    ];

    let outcome = agent
        .run(&prior, vec![Message::human("again")], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(roles(&outcome.messages), vec![MessageRole::Human, MessageRole::Ai]);
    let sent = &model.requests()[0].messages;
    assert_eq!(sent.len(), 4);
    assert_eq!(
        sent.iter().filter(|m| m.role == MessageRole::System).count(),
        1
    );
}
