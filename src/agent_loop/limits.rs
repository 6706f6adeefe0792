use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_ITERATIONS: usize = 10;
const DEFAULT_MODEL_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Bounds applied to every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    /// Maximum model calls per run.
    pub max_iterations: usize,
    pub model_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    /// Fail the run when the model calls a tool outside the allow-list,
    /// instead of answering with an error `tool` message.
    pub strict_tool_resolution: bool,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            model_timeout_ms: DEFAULT_MODEL_TIMEOUT_MS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            strict_tool_resolution: false,
        }
    }
}

impl LoopLimits {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Zero values fall back to defaults.
    pub(crate) fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_iterations: nonzero_or(self.max_iterations, defaults.max_iterations),
            model_timeout_ms: nonzero_or(self.model_timeout_ms, defaults.model_timeout_ms),
            tool_timeout_ms: nonzero_or(self.tool_timeout_ms, defaults.tool_timeout_ms),
            strict_tool_resolution: self.strict_tool_resolution,
        }
    }
}

fn nonzero_or<T: PartialEq + Default>(value: T, fallback: T) -> T {
    if value == T::default() {
        fallback
    } else {
        value
    }
}
