//! agent-worker
//!
//! Creates and executes agent tasks against the Postgres store.
//!
//! Usage:
//!   agent-worker create-task 7 "Summarize https://example.com/changelog"
//!   agent-worker run 42
//!   agent-worker steps 42
//!   agent-worker stats 7

mod config;

use std::sync::Arc;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    AgentCore, AgentId, Database, LlmProvider, LlmReasoner, ReasoningProvider, TaskExecutor, TaskId, TaskStore,
};
use agent_runtime::{OllamaProvider, PgConfig, PgDatabase};

use crate::config::{ReasonerKind, WorkerConfig};

#[derive(Parser)]
#[command(name = "agent-worker", about = "Create and execute agent tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a task through think, plan, execute, verify and compile
    Run { task_id: TaskId },
    /// Queue a new pending task for an agent
    CreateTask {
        agent_id: AgentId,
        description: String,
        /// Task input as a JSON object
        #[arg(long)]
        input: Option<String>,
    },
    /// Print an agent's task counters
    Stats { agent_id: AgentId },
    /// Print the recorded steps of a task
    Steps { task_id: TaskId },
}

fn log_filter(get: impl Fn(&str) -> Option<String>) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(get("RUST_LOG").unwrap_or_else(|| "info".into()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may carry RUST_LOG, so it is loaded before the filter is built
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(log_filter(|key| std::env::var(key).ok()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    let pg = PgConfig::new(&config.database_url).max_connections(config.database_max_connections);
    let db: Arc<dyn Database> = Arc::new(PgDatabase::connect(&pg).await?);

    let result = match cli.command {
        Command::Run { task_id } => run_task(&config, db.clone(), task_id).await,
        Command::CreateTask {
            agent_id,
            description,
            input,
        } => create_task(db.clone(), agent_id, &description, input.as_deref()).await,
        Command::Stats { agent_id } => print_stats(db.clone(), agent_id).await,
        Command::Steps { task_id } => print_steps(db.clone(), task_id).await,
    };

    db.close().await;
    result
}

async fn build_reasoner(kind: ReasonerKind) -> Option<Arc<dyn ReasoningProvider>> {
    match kind {
        ReasonerKind::Simulated => None,
        ReasonerKind::Ollama => {
            let provider = OllamaProvider::from_env();
            if !provider.health_check().await.unwrap_or(false) {
                tracing::warn!("Ollama not reachable; planning will fall back to the simulated plan");
            }
            Some(Arc::new(LlmReasoner::new(Arc::new(provider))))
        }
    }
}

async fn run_task(config: &WorkerConfig, db: Arc<dyn Database>, task_id: TaskId) -> anyhow::Result<()> {
    let task = TaskStore::new(db.clone())
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow!("Task {task_id} not found"))?;
    let agent = AgentCore::new(db.clone())
        .find_by_id(task.agent_id)
        .await?
        .ok_or_else(|| anyhow!("Agent {} not found", task.agent_id))?;

    let (tools, database_tool) = agent_tools::default_registry(config.http.clone())?;
    tracing::info!(task_id, agent_id = agent.id, tools = tools.len(), "Starting task");

    let mut executor = TaskExecutor::new(agent, db, Arc::new(tools)).with_config(config.executor.clone());
    if let Some(reasoner) = build_reasoner(config.reasoner).await {
        executor = executor.with_reasoner(reasoner);
    }

    let outcome = executor.execute(task_id).await;
    database_tool.close().await;
    let outcome = outcome?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        bail!(
            "Task {task_id} failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn create_task(
    db: Arc<dyn Database>,
    agent_id: AgentId,
    description: &str,
    input: Option<&str>,
) -> anyhow::Result<()> {
    if AgentCore::new(db.clone()).find_by_id(agent_id).await?.is_none() {
        bail!("Agent {agent_id} not found");
    }

    let input_data = match input {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => Value::Object(serde_json::Map::new()),
    };
    if !input_data.is_object() {
        bail!("--input must be a JSON object");
    }

    let task = TaskStore::new(db).create_task(agent_id, description, input_data).await?;
    tracing::info!(task_id = task.id, agent_id, "Task created");
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn print_stats(db: Arc<dyn Database>, agent_id: AgentId) -> anyhow::Result<()> {
    let stats = AgentCore::new(db)
        .get_stats(agent_id)
        .await?
        .ok_or_else(|| anyhow!("Agent {agent_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn print_steps(db: Arc<dyn Database>, task_id: TaskId) -> anyhow::Result<()> {
    let steps = TaskStore::new(db).get_task_steps(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&steps)?);
    Ok(())
}
