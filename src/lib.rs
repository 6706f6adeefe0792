//! Parley: session-aware, tool-calling chat agent.
//!
//! A caller sends a query. The agent loop alternates between the model and
//! the tools it asks for until the model gives a final answer. Tool access
//! is narrowed per caller role, and conversation history is persisted per
//! session.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::prelude::*;
//!
//! # async fn example() -> parley::error::Result<()> {
//! let mut registry = CapabilityRegistry::new();
//! registry.register(AgentTool::new(
//!     "get_price",
//!     "Look up the USD price of a coin by slug",
//!     ToolParameters::object().string("slug", "Coin slug, e.g. bitcoin", true).build(),
//!     |args, _ctx| async move { Ok(format!("price: 65000 USD ({})", args.get_str("slug")?)) },
//! ))?;
//!
//! let config = ParleyConfig::load(None)?;
//! let service = ChatService::from_config(&config, Arc::new(registry))?;
//! let caller = Caller::new("alice", CallerRole::User);
//! let reply = service.chat(&caller, ChatRequest::new("What is the price of bitcoin?")).await?;
//! println!("{} (session {})", reply.answer, reply.session_id);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod model;
pub mod policy;
pub mod prelude;
pub mod service;
pub mod session;
pub mod stream;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
