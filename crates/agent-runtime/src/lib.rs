//! # agent-runtime
//!
//! Runtime integrations for the agent engine.
//!
//! - **Postgres**: `PgDatabase`, the sqlx-backed `Database` used by
//!   `AgentCore`, `TaskStore` and the `DatabaseTool`
//! - **Ollama** (default feature): local LLM inference for `LlmReasoner`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{PgConfig, PgDatabase};
//!
//! let db = Arc::new(PgDatabase::connect(&PgConfig::new(url)).await?);
//! let executor = TaskExecutor::new(agent, db, Arc::new(tools));
//! ```

pub mod postgres;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use postgres::{PgConfig, PgDatabase};

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};
