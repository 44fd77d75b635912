//! Error taxonomy for Capstan
//!
//! Recoverable errors are caught at their boundary (tool boundary, provider
//! boundary) and converted into user-visible artifacts; only a fatal
//! `ConfigError` terminates startup.

use crate::types::ToolErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal configuration problems, surfaced before the agent loop starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    #[error("invalid value for {option}: {reason}")]
    InvalidValue { option: &'static str, reason: String },

    #[error("unknown provider dialect: {0}")]
    UnknownProvider(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors from the LLM provider boundary.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ProviderError {
    /// Transport and rate-limit failures are retried with backoff; the rest
    /// abort the current turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited { .. }
        )
    }
}

/// Errors at the tool boundary. Reported to the model as a failed result,
/// never aborts the run.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("tool timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

impl ToolError {
    pub fn code(&self) -> ToolErrorCode {
        match self {
            ToolError::NotFound(_) => ToolErrorCode::NotFound,
            ToolError::MissingParameter(_) => ToolErrorCode::MissingParameter,
            ToolError::InvalidParameter { .. } => ToolErrorCode::InvalidParameter,
            ToolError::PermissionDenied(_) => ToolErrorCode::PermissionDenied,
            ToolError::Timeout { .. } => ToolErrorCode::Timeout,
            ToolError::SecurityViolation(_) => ToolErrorCode::SecurityViolation,
            ToolError::Execution(_) => ToolErrorCode::Execution,
        }
    }
}

/// Outcome of the human-in-the-loop gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval denied: {reason}")]
    Denied { reason: String },

    #[error("approval_timeout")]
    Timeout,
}

/// Lane enqueue/execution failures, surfaced to the enqueueing caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneError {
    #[error("lane {lane} queue is full ({max_queue})")]
    QueueFull { lane: String, max_queue: usize },

    #[error("task {task} timed out after {timeout_ms}ms")]
    Timeout { task: String, timeout_ms: u64 },

    #[error("lane {0} is closed")]
    Closed(String),

    #[error("task {task} failed: {message}")]
    Failed { task: String, message: String },
}

/// Umbrella error for the workspace.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("lane error: {0}")]
    Lane(#[from] LaneError),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("cancelled")]
    Cancelled,

    #[error("session {0} is busy")]
    SessionBusy(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("turn limit of {0} exceeded")]
    MaxTurnsExceeded(usize),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
