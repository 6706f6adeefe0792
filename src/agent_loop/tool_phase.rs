//! Runs the tool calls of one `ai` message.

use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{LoopEvent, LoopEventEmitter};
use super::limits::LoopLimits;
use crate::error::ParleyError;
use crate::policy::AllowedTools;
use crate::tools::{validate_arguments, ToolArguments, ToolExecutionContext};
use crate::types::{Message, ToolCall};
use crate::util::with_timeout;

pub(super) struct ToolPhaseArgs<'a> {
    pub(super) allowed: &'a AllowedTools,
    pub(super) calls: &'a [ToolCall],
    pub(super) limits: &'a LoopLimits,
    pub(super) session_id: Option<&'a str>,
    pub(super) emitter: &'a LoopEventEmitter,
    pub(super) cancel: &'a CancellationToken,
}

/// Run every call concurrently and return one `tool` message per call, in
/// declaration order.
///
/// Only fails when strict resolution is on and a call names a tool outside
/// the allow-list; in that case nothing runs.
pub(super) async fn run_tool_phase(args: ToolPhaseArgs<'_>) -> Result<Vec<Message>, ParleyError> {
    let ToolPhaseArgs {
        allowed,
        calls,
        limits,
        session_id,
        emitter,
        cancel,
    } = args;

    if limits.strict_tool_resolution {
        if let Some(call) = calls.iter().find(|c| !allowed.contains(&c.name)) {
            warn!(tool_name = %call.name, tool_call_id = %call.id, "tool outside allow-list");
            return Err(ParleyError::UnauthorizedTool(call.name.clone()));
        }
    }

    let futures = calls.iter().map(|call| {
        execute_tool_call(allowed, call, limits, session_id, emitter, cancel.child_token())
    });
    Ok(future::join_all(futures).await)
}

async fn execute_tool_call(
    allowed: &AllowedTools,
    call: &ToolCall,
    limits: &LoopLimits,
    session_id: Option<&str>,
    emitter: &LoopEventEmitter,
    cancel: CancellationToken,
) -> Message {
    emitter.emit(LoopEvent::ToolCallStarted { call: call.clone() });

    let message = match invoke(allowed, call, limits, session_id, cancel).await {
        Ok(content) => Message::tool_result(&call.id, content),
        Err(error) => {
            debug!(tool_name = %call.name, tool_call_id = %call.id, %error, "tool call failed");
            Message::tool_error(&call.id, error)
        }
    };

    emitter.emit(LoopEvent::ToolCallFinished {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        is_error: message.is_error,
    });
    message
}

/// Resolve, validate, and run one call. `Err` is the text of the error message.
async fn invoke(
    allowed: &AllowedTools,
    call: &ToolCall,
    limits: &LoopLimits,
    session_id: Option<&str>,
    cancel: CancellationToken,
) -> Result<String, String> {
    let tool = allowed
        .get(&call.name)
        .ok_or_else(|| format!("Error: tool '{}' is not available.", call.name))?;

    validate_arguments(&call.arguments, &tool.parameters().schema)
        .map_err(|e| format!("Error: invalid arguments for '{}': {e}", call.name))?;

    let args = ToolArguments::new(call.arguments.clone());
    let ctx = ToolExecutionContext {
        tool_call_id: Some(call.id.clone()),
        session_id: session_id.map(str::to_string),
        cancel: cancel.clone(),
    };

    debug!(tool_name = %call.name, tool_call_id = %call.id, "executing tool");
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(ParleyError::Canceled),
        result = with_timeout(limits.tool_timeout(), tool.execute(&args, &ctx)) => result,
    };
    // Stop any work the tool spawned against its token.
    cancel.cancel();

    result.map_err(|error| match error {
        ParleyError::Timeout(ms) => {
            format!("Error: tool '{}' timed out after {ms}ms.", call.name)
        }
        ParleyError::Canceled => format!("Error: tool '{}' was canceled.", call.name),
        other => format!("Error: tool '{}' failed: {other}", call.name),
    })
}
