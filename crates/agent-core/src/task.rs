//! Tasks and Task Steps
//!
//! Persistence for units of work assigned to an agent and the step-by-step
//! record the executor writes while running them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentId;
use crate::db::{json_column, Database, Row};
use crate::error::{AgentError, Result};

pub type TaskId = i64;

/// Task lifecycle status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work assigned to an agent
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub task_description: String,
    pub input_data: Value,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step record status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// One executed action within a task run
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskStep {
    pub id: i64,
    pub task_id: TaskId,
    pub step_number: i64,
    pub action: String,
    pub tool: Option<String>,
    pub input: Value,
    pub output: Value,
    pub status: StepStatus,
    pub duration_ms: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Step record written by the executor
#[derive(Clone, Debug)]
pub struct NewTaskStep {
    pub step_number: i64,
    pub action: String,
    pub tool: Option<String>,
    pub input: Value,
    pub output: Value,
    pub status: StepStatus,
    pub duration_ms: i64,
}

/// Filter for `TaskStore::get_tasks_by_agent`
#[derive(Clone, Debug)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

fn normalize(mut row: Row, json_fields: &[(&str, Value)]) -> Row {
    for (field, default) in json_fields {
        let value = json_column(row.get(*field), default.clone());
        row.insert((*field).to_string(), value);
    }
    row.retain(|_, value| !value.is_null());
    row
}

/// Normalize a persisted task row; `None` in, `None` out
pub fn parse_task(row: Option<Row>) -> Result<Option<Task>> {
    let Some(row) = row else {
        return Ok(None);
    };
    let row = normalize(row, &[("input_data", json!({})), ("result", Value::Null)]);
    Ok(Some(serde_json::from_value(Value::Object(row))?))
}

/// Normalize a persisted step row; `None` in, `None` out
pub fn parse_step(row: Option<Row>) -> Result<Option<TaskStep>> {
    let Some(row) = row else {
        return Ok(None);
    };
    let row = normalize(row, &[("input", json!({})), ("output", Value::Null)]);
    Ok(Some(serde_json::from_value(Value::Object(row))?))
}

/// Task and step persistence
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<dyn Database>,
}

impl TaskStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn create_task(&self, agent_id: AgentId, description: &str, input_data: Value) -> Result<Task> {
        let description = description.trim();
        if description.is_empty() {
            return Err(AgentError::validation("Task description is required"));
        }

        let result = self
            .db
            .query(
                "INSERT INTO agent_tasks (agent_id, task_description, input_data, status) \
                 VALUES ($1, $2, $3::jsonb, 'pending') RETURNING *",
                &[
                    json!(agent_id),
                    json!(description),
                    json!(serde_json::to_string(&input_data)?),
                ],
            )
            .await?;

        let task = parse_task(result.into_first())?
            .ok_or_else(|| AgentError::Database("Insert returned no row".into()))?;
        tracing::info!(task_id = task.id, agent_id, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let result = self
            .db
            .query("SELECT * FROM agent_tasks WHERE id = $1", &[json!(id)])
            .await?;
        parse_task(result.into_first())
    }

    pub async fn get_tasks_by_agent(&self, agent_id: AgentId, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM agent_tasks WHERE agent_id = $1");
        let mut params = vec![json!(agent_id)];

        if let Some(status) = filter.status {
            params.push(json!(status.as_str()));
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
            .filter_map(|row| parse_task(Some(row)).transpose())
            .collect()
    }

    pub async fn get_task_steps(&self, task_id: TaskId) -> Result<Vec<TaskStep>> {
        let result = self
            .db
            .query(
                "SELECT * FROM agent_task_steps WHERE task_id = $1 ORDER BY step_number ASC",
                &[json!(task_id)],
            )
            .await?;
        result
            .rows
            .into_iter()
            .filter_map(|row| parse_step(Some(row)).transpose())
            .collect()
    }

    pub(crate) async fn mark_processing(&self, id: TaskId) -> Result<()> {
        self.db
            .query(
                "UPDATE agent_tasks SET status = 'processing', started_at = NOW() WHERE id = $1",
                &[json!(id)],
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn record_step(&self, task_id: TaskId, step: &NewTaskStep) -> Result<()> {
        self.db
            .query(
                "INSERT INTO agent_task_steps (task_id, step_number, action, tool, input, output, status, duration_ms) \
                 VALUES ($1, $2, $3, $4, $5::jsonb, $6::jsonb, $7, $8)",
                &[
                    json!(task_id),
                    json!(step.step_number),
                    json!(step.action),
                    json!(step.tool),
                    json!(serde_json::to_string(&step.input)?),
                    json!(serde_json::to_string(&step.output)?),
                    json!(step.status.as_str()),
                    json!(step.duration_ms),
                ],
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn finish(&self, id: TaskId, status: TaskStatus, result: &Value) -> Result<()> {
        self.db
            .query(
                "UPDATE agent_tasks SET status = $2, result = $3::jsonb, completed_at = NOW() WHERE id = $1",
                &[json!(id), json!(status.as_str()), json!(serde_json::to_string(result)?)],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{row, ScriptedDatabase};

    #[test]
    fn test_parse_task_none() {
        assert!(parse_task(None).unwrap().is_none());
        assert!(parse_step(None).unwrap().is_none());
    }

    #[test]
    fn test_parse_task_json_strings() {
        let task = parse_task(Some(row(json!({
            "id": 11,
            "agent_id": 7,
            "task_description": "Research pricing",
            "input_data": "{\"url\":\"https://example.com\"}",
            "status": "completed",
            "result": "{\"success\":true}",
            "created_at": "2026-01-05T10:00:00Z"
        }))))
        .unwrap()
        .unwrap();

        assert_eq!(task.input_data["url"], json!("https://example.com"));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"success": true})));
        assert!(task.created_at.is_some());
    }

    #[test]
    fn test_parse_task_null_fields() {
        let task = parse_task(Some(row(json!({"id": 1, "input_data": null, "result": null, "status": null}))))
            .unwrap()
            .unwrap();
        assert_eq!(task.input_data, json!({}));
        assert_eq!(task.result, None);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_parse_step() {
        let step = parse_step(Some(row(json!({
            "id": 3,
            "task_id": 11,
            "step_number": 2,
            "action": "fetch",
            "tool": "http_request",
            "input": "{\"url\":\"https://example.com\"}",
            "output": null,
            "status": "failed"
        }))))
        .unwrap()
        .unwrap();

        assert_eq!(step.step_number, 2);
        assert_eq!(step.tool.as_deref(), Some("http_request"));
        assert_eq!(step.input["url"], json!("https://example.com"));
        assert_eq!(step.output, Value::Null);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_create_task() {
        let db = Arc::new(ScriptedDatabase::new().on(
            "INSERT INTO agent_tasks",
            vec![row(json!({"id": 11, "agent_id": 7, "task_description": "Summarize", "input_data": "{}", "status": "pending"}))],
        ));
        let store = TaskStore::new(db.clone());

        let task = store.create_task(7, "Summarize", json!({"lang": "en"})).await.unwrap();
        assert_eq!(task.id, 11);
        assert_eq!(task.status, TaskStatus::Pending);

        let call = &db.calls()[0];
        assert_eq!(call.params[2], json!("{\"lang\":\"en\"}"));
    }

    #[tokio::test]
    async fn test_create_task_requires_description() {
        let store = TaskStore::new(Arc::new(ScriptedDatabase::new()));
        assert!(matches!(store.create_task(7, "  ", json!({})).await, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_tasks_by_agent_filter() {
        let db = Arc::new(ScriptedDatabase::new());
        let store = TaskStore::new(db.clone());

        let filter = TaskFilter {
            status: Some(TaskStatus::Failed),
            limit: 10,
            offset: 20,
        };
        store.get_tasks_by_agent(7, &filter).await.unwrap();

        let call = &db.calls()[0];
        assert!(call.sql.contains("status = $2"));
        assert_eq!(call.params, vec![json!(7), json!("failed"), json!(10), json!(20)]);
    }

    #[tokio::test]
    async fn test_get_task_steps_ordered_query() {
        let db = Arc::new(ScriptedDatabase::new().on(
            "FROM agent_task_steps",
            vec![
                row(json!({"step_number": 1, "action": "think"})),
                row(json!({"step_number": 2, "action": "plan"})),
            ],
        ));
        let store = TaskStore::new(db.clone());

        let steps = store.get_task_steps(11).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].action, "plan");
        assert!(db.calls()[0].sql.contains("ORDER BY step_number ASC"));
    }
}
