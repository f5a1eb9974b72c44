//! Error Types
//!
//! Three layers: [`ProviderError`] for adapter failures, [`ToolError`] for
//! tool invocation failures, and [`AgentError`] for everything the engine
//! can report at the loop, coordinator and dispatcher level.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failures surfaced by a provider adapter.
///
/// Adapters never retry; the caller decides based on [`ProviderError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials missing or rejected (401/403)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider asked us to slow down (429)
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Request did not complete within the endpoint timeout
    #[error("Provider timed out: {0}")]
    Timeout(String),

    /// Response body did not parse into the canonical shape
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// Network or connection failure, or a 5xx from the provider
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the request for a reason outside the taxonomy above
    #[error("Provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl ProviderError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::ProviderUnavailable(_)
        )
    }

    /// Server-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::Rejected { .. } => ErrorKind::Rejected,
        }
    }
}

/// Failures from a single tool invocation.
///
/// These are recovered into the conversation as `tool` messages and never
/// abort a run on their own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' timed out after {}ms", .after.as_millis())]
    ToolTimeout { tool: String, after: Duration },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecutionError { tool: String, message: String },
}

impl ToolError {
    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecutionError {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            Self::ToolExecutionError { .. } => ErrorKind::ToolExecutionError,
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error (after any retries)
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Tool error that escaped recovery
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Reasoning loop hit the agent's iteration cap
    #[error("Maximum iterations ({0}) exceeded")]
    MaxIterationsExceeded(usize),

    /// Fan-out deadline expired before the run finished
    #[error("Aggregate timeout after {}ms", .0.as_millis())]
    AggregateTimeout(Duration),

    /// Caller cancelled the run
    #[error("Run cancelled")]
    Cancelled,

    /// Attempted to mutate a run that already reached a terminal status
    #[error("Run {0} is already finalized")]
    RunFinalized(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal failure (e.g. a panicked run task)
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Provider(e) => e.kind(),
            AgentError::Tool(e) => e.kind(),
            AgentError::MaxIterationsExceeded(_) => ErrorKind::MaxIterationsExceeded,
            AgentError::AggregateTimeout(_) => ErrorKind::AggregateTimeout,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Config(_) => ErrorKind::Config,
            AgentError::RunFinalized(_)
            | AgentError::Persistence(_)
            | AgentError::Internal(_)
            | AgentError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Provider(ProviderError::Auth(_)) => {
                "Authentication with the model provider failed. Please check the API key.".into()
            }
            AgentError::Provider(ProviderError::RateLimited { .. }) => {
                "The model provider is rate limiting requests. Please wait a moment.".into()
            }
            AgentError::Provider(ProviderError::Timeout(_)) => {
                "The model provider did not respond in time. Please try again.".into()
            }
            AgentError::Provider(ProviderError::ProviderUnavailable(_)) => {
                "The model provider is currently unavailable. Please try again.".into()
            }
            AgentError::Provider(e) => format!("The model provider returned an error: {e}"),
            AgentError::Tool(e) => format!("Tool error: {e}"),
            AgentError::MaxIterationsExceeded(_) => {
                "The agent used too many reasoning steps. Please try a simpler request.".into()
            }
            AgentError::AggregateTimeout(_) => {
                "This model did not finish within the comparison time limit.".into()
            }
            AgentError::Cancelled => "The run was cancelled.".into(),
            AgentError::Config(msg) => format!("Configuration error: {msg}"),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}

/// Flat error classification recorded on failed runs and tool calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthError,
    RateLimited,
    Timeout,
    MalformedResponse,
    ProviderUnavailable,
    Rejected,
    InvalidArguments,
    ToolNotFound,
    ToolTimeout,
    ToolExecutionError,
    MaxIterationsExceeded,
    AggregateTimeout,
    Cancelled,
    Config,
    Internal,
}
