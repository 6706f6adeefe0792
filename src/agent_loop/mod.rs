//! Agent loop: the `AwaitModel` / `ExecuteTools` / `Done` state machine.

pub mod events;
pub mod limits;
pub mod runner;
pub mod state;
mod tool_phase;
pub mod types;

pub use events::{LoopEvent, LoopEventSink};
pub use limits::LoopLimits;
pub use runner::AgentLoop;
pub use state::{LoopState, Transition};
pub use types::*;
