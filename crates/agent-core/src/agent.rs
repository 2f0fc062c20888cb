//! Agent Definitions
//!
//! Persistence-backed CRUD and running statistics for agents, the
//! configuration object a `TaskExecutor` operates on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::db::{json_column, Database, Row};
use crate::error::{AgentError, Result};

pub type AgentId = i64;
pub type UserId = i64;

pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: i64 = 4096;

fn check_name(name: Option<&str>) -> Result<&str> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AgentError::validation("Agent name is required"))
}

fn check_temperature(temperature: Option<f64>) -> Result<f64> {
    temperature
        .filter(|t| (0.0..=2.0).contains(t))
        .ok_or_else(|| AgentError::validation("Temperature must be between 0 and 2"))
}

fn check_max_tokens(max_tokens: Option<i64>) -> Result<i64> {
    max_tokens
        .filter(|&n| n > 0)
        .ok_or_else(|| AgentError::validation("max_tokens must be positive"))
}

/// Columns that `AgentCore::update` may write
const UPDATABLE_FIELDS: &[&str] = &[
    "name",
    "description",
    "capabilities",
    "model",
    "temperature",
    "max_tokens",
    "system_prompt",
    "settings",
    "status",
];

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an autonomous AI agent that completes tasks by working through discrete phases.

1. THINK: Analyze the task. Identify the goal, constraints and the information you need.
2. PLAN: Break the task into ordered steps. Note which steps depend on others and which can run in parallel.
3. EXECUTE: Carry out each step, using the available tools when a step requires them.
4. VERIFY: Check every step result. If something failed, adjust the plan and try an alternative.
5. COMPLETE: Compile the verified results into a clear final answer.

Be precise, report failures honestly, and never invent tool results."#;

/// An autonomous worker definition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Agent {
    pub id: AgentId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    pub settings: Map<String, Value>,
    pub status: String,
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            id: 0,
            user_id: 0,
            name: String::new(),
            description: None,
            capabilities: Vec::new(),
            model: DEFAULT_MODEL.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: default_system_prompt().into(),
            settings: Map::new(),
            status: "active".into(),
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Agent {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Fields accepted by `AgentCore::create`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

impl NewAgent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Filter for `AgentCore::find_by_user`
#[derive(Clone, Debug)]
pub struct AgentFilter {
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for AgentFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Running task counters for an agent
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    /// Percentage of successful tasks, 0 when no task has run
    pub success_rate: f64,
}

/// The built-in THINK/PLAN/EXECUTE/VERIFY/COMPLETE prompt
pub fn default_system_prompt() -> &'static str {
    DEFAULT_SYSTEM_PROMPT
}

/// Normalize a persisted row into an `Agent`.
///
/// `capabilities` and `settings` may arrive as JSON text or already parsed;
/// null or missing values become empty containers. A missing row yields `None`.
pub fn parse_agent(row: Option<Row>) -> Result<Option<Agent>> {
    let Some(mut row) = row else {
        return Ok(None);
    };

    let capabilities = json_column(row.get("capabilities"), json!([]));
    let settings = json_column(row.get("settings"), json!({}));
    row.insert("capabilities".into(), capabilities);
    row.insert("settings".into(), settings);

    // Null columns fall back to the struct defaults
    row.retain(|_, value| !value.is_null());

    Ok(Some(serde_json::from_value(Value::Object(row))?))
}

/// Agent persistence and statistics
#[derive(Clone)]
pub struct AgentCore {
    db: Arc<dyn Database>,
}

impl AgentCore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Create an agent owned by `user_id`
    pub async fn create(&self, user_id: UserId, fields: NewAgent) -> Result<Agent> {
        let name = check_name(fields.name.as_deref())?;
        let temperature = check_temperature(Some(fields.temperature.unwrap_or(DEFAULT_TEMPERATURE)))?;
        let max_tokens = check_max_tokens(Some(fields.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)))?;

        let capabilities = fields.capabilities.unwrap_or_default();
        let settings = fields.settings.unwrap_or_default();

        let params = [
            json!(user_id),
            json!(name),
            json!(fields.description),
            json!(serde_json::to_string(&capabilities)?),
            json!(fields.model.unwrap_or_else(|| DEFAULT_MODEL.into())),
            json!(temperature),
            json!(max_tokens),
            json!(fields
                .system_prompt
                .unwrap_or_else(|| default_system_prompt().into())),
            json!(serde_json::to_string(&settings)?),
        ];

        let result = self
            .db
            .query(
                "INSERT INTO agents (user_id, name, description, capabilities, model, temperature, max_tokens, system_prompt, settings) \
                 VALUES ($1, $2, $3, $4::jsonb, $5, $6, $7, $8, $9::jsonb) RETURNING *",
                &params,
            )
            .await?;

        let agent = parse_agent(result.into_first())?
            .ok_or_else(|| AgentError::Database("Insert returned no row".into()))?;
        tracing::info!(agent_id = agent.id, user_id, "Agent created");
        Ok(agent)
    }

    pub async fn find_by_id(&self, id: AgentId) -> Result<Option<Agent>> {
        let result = self
            .db
            .query("SELECT * FROM agents WHERE id = $1", &[json!(id)])
            .await?;
        parse_agent(result.into_first())
    }

    pub async fn find_by_user(&self, user_id: UserId, filter: &AgentFilter) -> Result<Vec<Agent>> {
        let mut sql = String::from("SELECT * FROM agents WHERE user_id = $1");
        let mut params = vec![json!(user_id)];

        if let Some(status) = &filter.status {
            params.push(json!(status));
            sql.push_str(&format!(" AND status = ${}", params.len()));
        }

        params.push(json!(filter.limit));
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ${}", params.len()));
        params.push(json!(filter.offset));
        sql.push_str(&format!(" OFFSET ${}", params.len()));

        let result = self.db.query(&sql, &params).await?;
        result
            .rows
            .into_iter()
            .filter_map(|row| parse_agent(Some(row)).transpose())
            .collect()
    }

    /// Update whitelisted fields of an agent owned by `user_id`
    pub async fn update(&self, id: AgentId, user_id: UserId, fields: &Map<String, Value>) -> Result<Agent> {
        let mut assignments = Vec::new();
        let mut params = Vec::new();

        for &field in UPDATABLE_FIELDS {
            let Some(value) = fields.get(field) else {
                continue;
            };
            let value = match field {
                "name" => json!(check_name(value.as_str())?),
                "temperature" => json!(check_temperature(value.as_f64())?),
                "max_tokens" => json!(check_max_tokens(value.as_i64())?),
                "capabilities" | "settings" => json!(serde_json::to_string(value)?),
                _ => value.clone(),
            };
            params.push(value);
            let cast = if matches!(field, "capabilities" | "settings") { "::jsonb" } else { "" };
            assignments.push(format!("{} = ${}{}", field, params.len(), cast));
        }

        if assignments.is_empty() {
            return Err(AgentError::validation("No valid fields to update"));
        }

        params.push(json!(id));
        let id_idx = params.len();
        params.push(json!(user_id));
        let user_idx = params.len();

        let sql = format!(
            "UPDATE agents SET {}, updated_at = NOW() WHERE id = ${} AND user_id = ${} RETURNING *",
            assignments.join(", "),
            id_idx,
            user_idx
        );

        let result = self.db.query(&sql, &params).await?;
        let agent = parse_agent(result.into_first())?
            .ok_or_else(|| AgentError::not_found("Agent not found or access denied"))?;

        tracing::debug!(agent_id = id, fields = assignments.len(), "Agent updated");
        Ok(agent)
    }

    pub async fn delete(&self, id: AgentId, user_id: UserId) -> Result<bool> {
        let result = self
            .db
            .query(
                "DELETE FROM agents WHERE id = $1 AND user_id = $2 RETURNING id",
                &[json!(id), json!(user_id)],
            )
            .await?;

        if result.rows.is_empty() {
            return Err(AgentError::not_found("Agent not found or access denied"));
        }
        tracing::info!(agent_id = id, "Agent deleted");
        Ok(true)
    }

    /// Record one finished task; a single statement keeps the counters consistent
    pub async fn update_stats(&self, id: AgentId, success: bool) -> Result<()> {
        self.db
            .query(
                "UPDATE agents SET total_tasks = total_tasks + 1, \
                 successful_tasks = successful_tasks + CASE WHEN $2 THEN 1 ELSE 0 END, \
                 failed_tasks = failed_tasks + CASE WHEN $2 THEN 0 ELSE 1 END, \
                 updated_at = NOW() WHERE id = $1",
                &[json!(id), json!(success)],
            )
            .await?;
        Ok(())
    }

    pub async fn get_stats(&self, id: AgentId) -> Result<Option<AgentStats>> {
        let result = self
            .db
            .query(
                "SELECT total_tasks, successful_tasks, failed_tasks FROM agents WHERE id = $1",
                &[json!(id)],
            )
            .await?;

        Ok(result.into_first().map(|row| {
            let counter = |key: &str| row.get(key).and_then(Value::as_i64).unwrap_or(0);
            let total_tasks = counter("total_tasks");
            let successful_tasks = counter("successful_tasks");
            let success_rate = if total_tasks > 0 {
                successful_tasks as f64 / total_tasks as f64 * 100.0
            } else {
                0.0
            };
            AgentStats {
                total_tasks,
                successful_tasks,
                failed_tasks: counter("failed_tasks"),
                success_rate,
            }
        }))
    }

    /// Cheap authorization check without fetching the full row
    pub async fn validate_ownership(&self, id: AgentId, user_id: UserId) -> Result<bool> {
        let result = self
            .db
            .query(
                "SELECT id FROM agents WHERE id = $1 AND user_id = $2",
                &[json!(id), json!(user_id)],
            )
            .await?;
        Ok(!result.rows.is_empty())
    }
}
