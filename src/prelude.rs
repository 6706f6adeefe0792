//! Convenience re-exports for common use.

pub use crate::agent_loop::{AgentConfig, AgentLoop, LoopEvent, LoopLimits, RunOutcome, RunStatus};
pub use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use crate::config::ParleyConfig;
pub use crate::error::{ParleyError, Result};
pub use crate::model::{ModelCapability, ModelRequest, ModelResponse};
pub use crate::policy::{AllowedTools, AuthorizationFilter, CallerRole, ToolPolicy};
pub use crate::service::{Caller, ChatRequest, ChatResponse, ChatService};
pub use crate::session::{Session, SessionManager};
pub use crate::stream::{ResponseStream, StreamChunk};
pub use crate::tools::{AgentTool, CapabilityRegistry, Tool, ToolArguments, ToolParameters};
pub use crate::types::{GenerationSettings, Message, MessageRole, ToolCall, Usage};
