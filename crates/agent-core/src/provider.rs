//! Model Backends
//!
//! `LlmReasoner` reaches a model only through `LlmProvider`; Ollama lives in
//! `agent-runtime` and tests use scripted providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::error::Result;
use crate::message::Message;

/// Sampling settings for one completion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model: String,
    /// 0.0 to 2.0
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            temperature: DEFAULT_TEMPERATURE as f32,
            max_tokens: u32::try_from(DEFAULT_MAX_TOKENS).unwrap_or(u32::MAX),
            top_p: 0.9,
        }
    }
}

impl GenerationOptions {
    /// The agent's own model, temperature and token limit
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_agent(agent: &Agent) -> Self {
        let defaults = Self::default();
        Self {
            model: agent.model.clone(),
            temperature: agent.temperature as f32,
            max_tokens: u32::try_from(agent.max_tokens).unwrap_or(defaults.max_tokens),
            ..defaults
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    /// Model that actually answered, which may differ from the one requested
    pub model: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend is reachable
    async fn health_check(&self) -> Result<bool>;

    async fn complete(&self, messages: &[Message], options: &GenerationOptions) -> Result<Completion>;
}
