//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Caller supplied invalid input (missing name, no valid update fields, ...)
    #[error("{0}")]
    Validation(String),

    /// Agent or task does not exist, or is not owned by the caller
    #[error("{0}")]
    NotFound(String),

    /// Persistence layer failure
    #[error("Database error: {0}")]
    Database(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// An operation exceeded its deadline
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Shorthand for a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        AgentError::Validation(msg.into())
    }

    /// Shorthand for a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        AgentError::NotFound(msg.into())
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Validation(msg) | AgentError::NotFound(msg) => msg.clone(),
            AgentError::ToolNotFound(name) => format!("The tool '{}' is not available.", name),
            AgentError::ToolValidation(msg) => format!("Invalid tool input: {}", msg),
            AgentError::ToolExecution(msg) => format!("Tool error: {}", msg),
            AgentError::Timeout(_) => "The operation timed out. Please try again.".into(),
            AgentError::Provider(msg) => format!("The AI service encountered an error: {}", msg),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_bare() {
        let err = AgentError::validation("No valid fields to update");
        assert_eq!(err.to_string(), "No valid fields to update");
        assert_eq!(err.user_message(), "No valid fields to update");
    }

    #[test]
    fn test_timeout_message() {
        let err = AgentError::Timeout(30_000);
        assert_eq!(err.to_string(), "Request timeout after 30000ms");
        assert_eq!(err.user_message(), "The operation timed out. Please try again.");
    }
}
