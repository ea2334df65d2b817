use serde::{Deserialize, Serialize};

/// Stable machine-readable error tags.
///
/// These codes are part of the runtime contract: the retry manager consults
/// them to decide whether an operation may be retried, and the loop composer
/// surfaces them unchanged in `loop:error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AgentNotFound,
    SessionNotFound,
    InvalidInput,
    LockHeld,
    ScopeViolation,
    AuthenticationFailed,
    TransientIo,
    LlmTransient,
    ToolTransient,
    ExecutionTimeout,
    ToolTimeout,
    MaxIterations,
    MemoryOverLimit,
    Escalated,
    Aborted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::LockHeld => "LOCK_HELD",
            Self::ScopeViolation => "SCOPE_VIOLATION",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::TransientIo => "TRANSIENT_IO",
            Self::LlmTransient => "LLM_TRANSIENT",
            Self::ToolTransient => "TOOL_TRANSIENT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::ToolTimeout => "TOOL_TIMEOUT",
            Self::MaxIterations => "MAX_ITERATIONS",
            Self::MemoryOverLimit => "MEMORY_OVER_LIMIT",
            Self::Escalated => "ESCALATED",
            Self::Aborted => "ABORTED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether an operation failing with this code may be retried with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientIo | Self::LlmTransient | Self::ToolTransient
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared error type used across all VaultAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session {session_id} is locked by run {holder}")]
    LockHeld { session_id: String, holder: String },

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("LLM: {0}")]
    Llm(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("execution timed out after {0} ms")]
    ExecutionTimeout(u64),

    #[error("tool {tool} timed out after {timeout_ms} ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("tool iteration limit reached ({0})")]
    MaxIterations(u32),

    #[error("total memory limit exceeded: {size_used} > {size_limit}")]
    MemoryOverLimit { size_used: usize, size_limit: usize },

    #[error("operation {operation_id} escalated after {attempts} attempts: {last_error}")]
    Escalated {
        operation_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("aborted")]
    Aborted,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The stable tag for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::TransientIo,
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::InvalidInput(_) | Self::Json(_) | Self::Config(_) => ErrorCode::InvalidInput,
            Self::LockHeld { .. } => ErrorCode::LockHeld,
            Self::ScopeViolation(_) => ErrorCode::ScopeViolation,
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::Llm(_) => ErrorCode::LlmTransient,
            Self::Tool { .. } => ErrorCode::ToolTransient,
            Self::ExecutionTimeout(_) => ErrorCode::ExecutionTimeout,
            Self::ToolTimeout { .. } => ErrorCode::ToolTimeout,
            Self::MaxIterations(_) => ErrorCode::MaxIterations,
            Self::MemoryOverLimit { .. } => ErrorCode::MemoryOverLimit,
            Self::Escalated { .. } => ErrorCode::Escalated,
            Self::Aborted => ErrorCode::Aborted,
            Self::Other(_) => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
