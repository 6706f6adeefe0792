//! Error classification used by callers to route recovery.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    Configuration,
    Serialization,
    ToolExecution,
    Checkpoint,
    Canceled,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    RetryFromLastCommit,
    CheckCredentials,
    CheckConfiguration,
    CheckToolPolicy,
    IncreaseTimeout,
    CheckToolImplementation,
    ContactSupport,
}
