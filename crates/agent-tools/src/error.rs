//! Error Types for Agent Tools

use agent_core::AgentError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Access to internal URLs is not allowed: {0}")]
    BlockedUrl(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<u64>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response too large: more than {0} bytes")]
    ResponseTooLarge(usize),

    #[error("Invalid JSON response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported database type: {0} (only postgres is supported)")]
    UnsupportedBackend(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Query rejected: {0}")]
    QueryRejected(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl ToolError {
    /// Kind tag reported in failed tool results
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidUrl(_) => "invalid_url",
            ToolError::BlockedUrl(_) => "blocked_url",
            ToolError::Timeout(_) => "timeout",
            ToolError::Status { .. } => "http_status",
            ToolError::Network(_) => "network",
            ToolError::ResponseTooLarge(_) => "response_too_large",
            ToolError::InvalidResponse(_) => "invalid_response",
            ToolError::UnsupportedBackend(_) => "unsupported_backend",
            ToolError::InvalidIdentifier(_) | ToolError::QueryRejected(_) | ToolError::InvalidParams(_) => {
                "validation"
            }
            ToolError::Database(_) => "database",
        }
    }

    /// Network failures and server errors; never auth or other client errors
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Network(_) => true,
            ToolError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<ToolError> for AgentError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Timeout(ms) => AgentError::Timeout(ms),
            ToolError::InvalidUrl(_)
            | ToolError::BlockedUrl(_)
            | ToolError::InvalidIdentifier(_)
            | ToolError::QueryRejected(_)
            | ToolError::InvalidParams(_) => AgentError::ToolValidation(err.to_string()),
            ToolError::Database(msg) => AgentError::Database(msg),
            other => AgentError::ToolExecution(other.to_string()),
        }
    }
}

impl From<AgentError> for ToolError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Database(msg) => ToolError::Database(msg),
            AgentError::Timeout(ms) => ToolError::Timeout(ms),
            other => ToolError::Database(other.to_string()),
        }
    }
}
