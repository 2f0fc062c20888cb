//! # agent-core
//!
//! Autonomous agent task execution: agent definitions, tasks, the cognitive
//! loop with recovery and replanning, and the extensible tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         TaskExecutor                              │
//! │  ┌───────────────┐  ┌─────────────┐  ┌────────────────────────┐  │
//! │  │ think / plan  │  │    Tool     │  │   ReasoningProvider    │  │
//! │  │ execute /     │──│  Registry   │──│ (simulated | LLM)      │  │
//! │  │ verify        │  └─────────────┘  └────────────────────────┘  │
//! │  └───────────────┘                                               │
//! │  ExecutionContext: history, short/long-term + working memory,    │
//! │                    redacted tool logs                            │
//! └──────────────────────────────────────────────────────────────────┘
//!            │ AgentCore / TaskStore
//!            ▼
//!        Database (query(sql, params) -> rows)
//! ```
//!
//! Persistence goes through the `Database` trait and model calls through
//! `LlmProvider`, so backends are swapped without touching executor logic.

pub mod agent;
pub mod db;
pub mod error;
pub mod executor;
pub mod log;
pub mod memory;
pub mod message;
pub mod provider;
pub mod task;
pub mod tool;

pub use agent::{Agent, AgentCore, AgentFilter, AgentId, AgentStats, NewAgent, UserId};
pub use db::{Database, QueryResult, Row};
pub use error::{AgentError, Result};
pub use executor::plan::{Plan, PlanStep};
pub use executor::reasoning::{LlmReasoner, ReasoningProvider, SimulatedReasoner};
pub use executor::recovery::{ErrorKind, RecoveryAction};
pub use executor::{ExecutorConfig, TaskExecutor, TaskOutcome};
pub use log::{sanitize_for_log, ToolLog, ToolLogEntry};
pub use memory::{ExecutionContext, Phase};
pub use message::{Message, Role};
pub use provider::{Completion, GenerationOptions, LlmProvider};
pub use task::{Task, TaskFilter, TaskId, TaskStatus, TaskStep, TaskStore};
pub use tool::{ParameterSchema, Tool, ToolCall, ToolContext, ToolRegistry, ToolResult, ToolSchema};
