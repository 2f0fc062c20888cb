//! Task Executor
//!
//! Runs one task against one agent through the cognitive loop:
//!
//! ```text
//! pending -> thinking -> planning -> executing -> verifying -> completed
//!                                        |                        |
//!                                        +--> (recovery/replan) --+--> failed
//! ```
//!
//! Steps that name a registered tool are dispatched through the
//! `ToolRegistry`; everything else goes to the `ReasoningProvider`. Failed
//! attempts are classified and routed through the recovery strategies, and a
//! step that cannot be recovered by retrying is replaced by alternative steps
//! (at most three times per execution).

pub mod plan;
pub mod reasoning;
pub mod recovery;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{Agent, AgentCore};
use crate::db::Database;
use crate::error::{AgentError, Result};
use crate::log::ToolLog;
use crate::memory::{ExecutionContext, Phase};
use crate::task::{NewTaskStep, StepStatus, Task, TaskId, TaskStatus, TaskStore};
use crate::tool::{ToolCall, ToolContext, ToolRegistry};

use plan::{generate_alternative_steps, identify_parallel_groups, Plan, PlanStep, MAX_PLAN_REVISIONS, WAIT_ACTION};
use reasoning::{ReasoningProvider, SimulatedReasoner, StepOutput};
use recovery::{
    classify_error, extract_wait_time, ErrorKind, ErrorRecord, FailureInfo, RecoveryAction, RecoveryStrategies,
};

/// Executor tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retries per step before a retrying strategy is forced to replan
    pub max_step_retries: u32,
    /// First backoff delay; doubles on each network retry
    pub base_backoff_ms: u64,
    /// Upper bound for any single wait
    pub max_wait_ms: u64,
    /// Wait used for rate limits that carry no retry-after hint
    pub default_rate_limit_wait_ms: u64,
    /// Capped at `MAX_PLAN_REVISIONS`
    pub max_plan_revisions: u32,
    /// Dispatch independent steps concurrently
    pub parallel_steps: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            base_backoff_ms: 1000,
            max_wait_ms: 300_000,
            default_rate_limit_wait_ms: 5000,
            max_plan_revisions: MAX_PLAN_REVISIONS,
            parallel_steps: true,
        }
    }
}

impl ExecutorConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn default_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.default_rate_limit_wait_ms)
    }

    fn revision_limit(&self) -> u32 {
        self.max_plan_revisions.min(MAX_PLAN_REVISIONS)
    }
}

/// What `TaskExecutor::execute` reports back
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub steps_executed: usize,
    pub plan_revisions: u32,
    pub duration_ms: u64,
}

/// A step that could not be recovered by retrying
#[derive(Clone, Debug)]
struct StepFailure {
    info: FailureInfo,
    action: RecoveryAction,
}

struct StepReport {
    result: std::result::Result<Value, StepFailure>,
    errors: Vec<ErrorRecord>,
    elapsed: Duration,
}

/// Borrowed view of the executor used while steps are in flight, so several
/// steps of one group can run at once
struct StepRunner<'a> {
    agent: &'a Agent,
    task: &'a Task,
    tools: &'a ToolRegistry,
    reasoner: &'a dyn ReasoningProvider,
    strategies: &'a RecoveryStrategies,
    config: &'a ExecutorConfig,
    logs: ToolLog,
}

impl StepRunner<'_> {
    async fn attempt(&self, step: &PlanStep) -> Result<Value> {
        if step.action == WAIT_ACTION {
            let requested = step.params.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
            let wait_ms = requested.min(self.config.max_wait_ms);
            tracing::debug!(step_id = %step.id, wait_ms, "Waiting");
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            return Ok(json!({ "waited_ms": wait_ms }));
        }

        let name = step.tool_name();
        if !self.tools.has(name) {
            return self.reasoner.execute_step(self.agent, self.task, step).await;
        }

        let mut call = ToolCall::from_params(name, &step.params);
        call.id = Some(step.id.clone());
        let ctx = ToolContext::new(self.logs.clone()).for_step(self.task.id, &step.id);
        let result = self.tools.execute(&call, &ctx).await?;

        if result.success {
            Ok(result.to_value())
        } else {
            Err(AgentError::ToolExecution(
                result.error().unwrap_or("Tool reported failure").to_string(),
            ))
        }
    }

    async fn run(&self, step: &PlanStep) -> StepReport {
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.attempt(step).await {
                Ok(output) => {
                    return StepReport {
                        result: Ok(output),
                        errors,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) => err,
            };

            let message = err.to_string();
            let info = FailureInfo {
                step_id: step.id.clone(),
                kind: classify_error(&message),
                wait_hint: extract_wait_time(&message),
                message,
                attempt,
            };

            let mut action = self.strategies.resolve(&info);
            if matches!(action, RecoveryAction::Retry { .. }) && attempt > self.config.max_step_retries {
                action = RecoveryAction::Replan;
            }

            tracing::warn!(
                task_id = self.task.id,
                step_id = %step.id,
                kind = %info.kind,
                attempt,
                action = action.name(),
                error = %info.message,
                "Step attempt failed"
            );
            errors.push(ErrorRecord::new(&info, &action));

            match action {
                RecoveryAction::Retry { wait } => {
                    if let Some(wait) = wait {
                        tokio::time::sleep(wait.min(self.config.max_wait())).await;
                    }
                }
                action => {
                    return StepReport {
                        result: Err(StepFailure { info, action }),
                        errors,
                        elapsed: started.elapsed(),
                    };
                }
            }
        }
    }
}

/// Executes tasks for one agent
pub struct TaskExecutor {
    agent: Agent,
    agents: AgentCore,
    tasks: TaskStore,
    tools: Arc<ToolRegistry>,
    reasoner: Arc<dyn ReasoningProvider>,
    config: ExecutorConfig,
    strategies: RecoveryStrategies,
    context: ExecutionContext,
    error_history: Vec<ErrorRecord>,
    current_plan: Option<Plan>,
}

impl TaskExecutor {
    pub fn new(agent: Agent, db: Arc<dyn Database>, tools: Arc<ToolRegistry>) -> Self {
        let config = ExecutorConfig::default();
        Self {
            agent,
            agents: AgentCore::new(db.clone()),
            tasks: TaskStore::new(db),
            tools,
            reasoner: Arc::new(SimulatedReasoner),
            strategies: RecoveryStrategies::defaults(&config),
            config,
            context: ExecutionContext::new(),
            error_history: Vec::new(),
            current_plan: None,
        }
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn ReasoningProvider>) -> Self {
        self.reasoner = reasoner;
        self
    }

    /// Replace the configuration; default strategies are rebuilt from it
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.strategies = RecoveryStrategies::defaults(&config);
        self.config = config;
        self
    }

    /// Register or replace the recovery strategy for `kind`
    pub fn add_recovery_strategy<F>(&mut self, kind: ErrorKind, strategy: F)
    where
        F: Fn(&FailureInfo) -> RecoveryAction + Send + Sync + 'static,
    {
        self.strategies.insert(kind, strategy);
    }

    /// Remove every strategy; failures then abort
    pub fn clear_recovery_strategies(&mut self) {
        self.strategies.clear();
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn error_history(&self) -> &[ErrorRecord] {
        &self.error_history
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current_plan.as_ref()
    }

    pub fn plan_revisions(&self) -> u32 {
        self.context.plan_revisions()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Run a task to completion or failure.
    ///
    /// Only a missing task (or one assigned to another agent) is an `Err`;
    /// execution failures are persisted and reported in the outcome. Agent
    /// statistics are updated exactly once either way.
    pub async fn execute(&mut self, task_id: TaskId) -> Result<TaskOutcome> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| AgentError::not_found(format!("Task {task_id} not found")))?;

        if task.agent_id != self.agent.id {
            return Err(AgentError::validation(format!(
                "Task {task_id} belongs to agent {}, not {}",
                task.agent_id, self.agent.id
            )));
        }

        self.context = ExecutionContext::new();
        self.error_history.clear();
        self.current_plan = None;

        let started = Instant::now();
        tracing::info!(task_id, agent_id = self.agent.id, reasoner = self.reasoner.name(), "Executing task");
        self.context.record_event(Phase::Pending, json!({ "task_id": task_id }));
        self.tasks.mark_processing(task_id).await?;

        let mut steps_executed = 0;
        let run = self.run_loop(&task, &mut steps_executed).await;

        let (success, result, error) = match run {
            Ok(result) => {
                self.context.record_event(Phase::Completed, json!({ "steps": steps_executed }));
                (true, result, None)
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "Task failed");
                self.context.record_event(Phase::Failed, json!({ "error": err.to_string() }));
                let result = json!({
                    "success": false,
                    "error": err.to_string(),
                    "message": err.user_message(),
                    "error_history": self.error_history,
                    "plan_revisions": self.plan_revisions(),
                });
                (false, result, Some(err.to_string()))
            }
        };

        let status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        if let Err(err) = self.tasks.finish(task_id, status, &result).await {
            tracing::error!(task_id, error = %err, "Failed to persist task result");
        }
        if let Err(err) = self.agents.update_stats(self.agent.id, success).await {
            tracing::error!(agent_id = self.agent.id, error = %err, "Failed to update agent stats");
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(task_id, success, steps_executed, duration_ms, "Task finished");

        Ok(TaskOutcome {
            task_id,
            success,
            result,
            error,
            steps_executed,
            plan_revisions: self.plan_revisions(),
            duration_ms,
        })
    }

    async fn run_loop(&mut self, task: &Task, steps_executed: &mut usize) -> Result<Value> {
        self.context.record_event(Phase::Thinking, Value::Null);
        let thinking = self.reasoner.think(&self.agent, task).await?;
        let thinking_value = serde_json::to_value(&thinking)?;
        self.context.store_long_term_memory("thinking", thinking_value.clone());
        self.context.record_event(Phase::Thinking, thinking_value);

        let plan = self.reasoner.plan(&self.agent, task, &thinking, &self.tools).await?.into_ordered()?;
        tracing::debug!(task_id = task.id, steps = plan.steps.len(), "Plan ready");
        self.context.record_event(
            Phase::Planning,
            json!({ "steps": plan.steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>() }),
        );
        self.current_plan = Some(plan);

        let outputs = self.execute_plan(task, steps_executed).await?;

        let verification = verify_outputs(&outputs);
        self.context.record_event(Phase::Verifying, verification.clone());

        let mut result = self.reasoner.compile(&self.agent, task, &outputs).await?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("success".into(), json!(true));
            obj.insert("verification".into(), verification);
            obj.insert("plan_revisions".into(), json!(self.plan_revisions()));
        } else {
            result = json!({ "success": true, "output": result, "verification": verification });
        }
        Ok(result)
    }

    async fn execute_plan(&mut self, task: &Task, steps_executed: &mut usize) -> Result<Vec<StepOutput>> {
        let mut completed: HashMap<String, Value> = HashMap::new();

        loop {
            let pending: Vec<PlanStep> = self
                .current_plan
                .iter()
                .flat_map(|p| p.steps.iter())
                .filter(|s| !completed.contains_key(&s.id))
                .cloned()
                .collect();

            let groups = identify_parallel_groups(&pending);
            let Some(first) = groups.first() else {
                break;
            };
            let group: Vec<PlanStep> = first.iter().map(|&i| pending[i].clone()).collect();

            self.context.record_event(
                Phase::Executing,
                json!({ "group": group.iter().map(|s| s.id.as_str()).collect::<Vec<_>>() }),
            );
            let reports = self.run_group(task, &group).await;

            let mut failures: Vec<(PlanStep, StepFailure)> = Vec::new();
            for (step, report) in group.into_iter().zip(reports) {
                *steps_executed += 1;
                self.error_history.extend(report.errors);

                let (status, output) = match &report.result {
                    Ok(output) => (StepStatus::Completed, output.clone()),
                    Err(f) => (StepStatus::Failed, json!({ "error": f.info.message, "kind": f.info.kind })),
                };
                let record = NewTaskStep {
                    step_number: i64::try_from(*steps_executed).unwrap_or(i64::MAX),
                    action: step.action.clone(),
                    tool: Some(step.tool_name().to_string()).filter(|t| self.tools.has(t)),
                    input: step.params.clone(),
                    output,
                    status,
                    duration_ms: i64::try_from(report.elapsed.as_millis()).unwrap_or(i64::MAX),
                };
                self.tasks.record_step(task.id, &record).await?;

                match report.result {
                    Ok(output) => {
                        self.remember(&step, &output);
                        completed.insert(step.id.clone(), output);
                    }
                    Err(f) => failures.push((step, f)),
                }
            }

            // An abort anywhere in the group ends the task before anything is replanned
            if let Some((step, failure)) = failures.iter().find(|(_, f)| f.action == RecoveryAction::Abort) {
                return Err(AgentError::ToolExecution(format!(
                    "Step '{}' aborted: {}",
                    step.id, failure.info.message
                )));
            }
            for (step, failure) in &failures {
                if self.revise_plan(step, &failure.info).is_none() {
                    return Err(AgentError::ToolExecution(format!(
                        "Step '{}' failed after {} plan revisions: {}",
                        step.id,
                        self.plan_revisions(),
                        failure.info.message
                    )));
                }
            }
        }

        Ok(self
            .current_plan
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter_map(|s| {
                completed.remove(&s.id).map(|output| StepOutput {
                    step_id: s.id.clone(),
                    action: s.action.clone(),
                    output,
                })
            })
            .collect())
    }

    async fn run_group(&self, task: &Task, group: &[PlanStep]) -> Vec<StepReport> {
        let runner = self.runner(task);
        if self.config.parallel_steps && group.len() > 1 {
            join_all(group.iter().map(|step| runner.run(step))).await
        } else {
            let mut reports = Vec::with_capacity(group.len());
            for step in group {
                reports.push(runner.run(step).await);
            }
            reports
        }
    }

    fn runner<'a>(&'a self, task: &'a Task) -> StepRunner<'a> {
        StepRunner {
            agent: &self.agent,
            task,
            tools: &self.tools,
            reasoner: self.reasoner.as_ref(),
            strategies: &self.strategies,
            config: &self.config,
            logs: self.context.tool_log(),
        }
    }

    fn remember(&mut self, step: &PlanStep, output: &Value) {
        self.context.add_to_short_term_memory(json!({
            "step": step.id,
            "action": step.action,
            "output": output,
        }));
        self.context.update_working_memory("last_step", json!(step.id));
        self.context.store_long_term_memory(format!("step:{}", step.id), output.clone());
    }

    /// Run one step with retries and recovery, outside the plan loop.
    ///
    /// Recovery attempts are appended to the error history; a step that would
    /// need replanning or aborting is returned as an error.
    pub async fn execute_step_with_recovery(&mut self, task: &Task, step: &PlanStep) -> Result<Value> {
        let report = self.runner(task).run(step).await;
        self.error_history.extend(report.errors);
        report
            .result
            .map_err(|f| AgentError::ToolExecution(format!("{} ({})", f.info.message, f.action.name())))
    }

    /// Replace `failed` in the current plan with alternative steps.
    ///
    /// Returns `None` once the revision limit is reached.
    pub fn revise_plan(&mut self, failed: &PlanStep, failure: &FailureInfo) -> Option<Vec<PlanStep>> {
        if self.context.plan_revisions() >= self.config.revision_limit() {
            tracing::warn!(step_id = %failed.id, revisions = self.context.plan_revisions(), "Plan revision limit reached");
            return None;
        }

        let revision = self.context.bump_plan_revisions();
        let wait = failure
            .wait_hint
            .unwrap_or_else(|| self.config.default_rate_limit_wait())
            .min(self.config.max_wait());
        let alternatives = generate_alternative_steps(failed, failure.kind, wait);

        let plan = self.current_plan.get_or_insert_with(Plan::default);
        if !plan.replace_step(&failed.id, alternatives.clone()) {
            plan.steps.extend(alternatives.iter().cloned());
        }
        plan.revision = revision;

        let ids: Vec<&str> = alternatives.iter().map(|s| s.id.as_str()).collect();
        tracing::info!(step_id = %failed.id, revision, kind = %failure.kind, alternatives = ?ids, "Plan revised");
        self.context.record_event(
            Phase::Planning,
            json!({ "revision": revision, "replaced": failed.id, "alternatives": ids }),
        );
        Some(alternatives)
    }
}

/// Null outputs and outputs reporting `success: false` are issues
fn verify_outputs(outputs: &[StepOutput]) -> Value {
    let issues: Vec<Value> = outputs
        .iter()
        .filter_map(|o| {
            let issue = if o.output.is_null() {
                "Step produced no output"
            } else if o.output.get("success") == Some(&Value::Bool(false)) {
                "Step reported failure"
            } else {
                return None;
            };
            Some(json!({ "step_id": o.step_id, "issue": issue }))
        })
        .collect();

    json!({
        "verified": issues.is_empty(),
        "issues": issues,
        "checked": outputs.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::db::testing::{row, ScriptedDatabase};
    use crate::tool::{Tool, ToolResult, ToolSchema};
    use plan::HTTP_TOOL;
    use reasoning::Thinking;

    const TASK_QUERY: &str = "SELECT * FROM agent_tasks WHERE id";
    const STATS_UPDATE: &str = "UPDATE agents SET total_tasks";
    const FINISH_UPDATE: &str = "UPDATE agent_tasks SET status = $2";

    fn agent() -> Agent {
        Agent {
            id: 1,
            user_id: 9,
            name: "Bot".into(),
            ..Agent::default()
        }
    }

    fn db_with_task(description: &str, input: Value) -> Arc<ScriptedDatabase> {
        Arc::new(ScriptedDatabase::new().on(
            TASK_QUERY,
            vec![row(json!({
                "id": 42,
                "agent_id": 1,
                "task_description": description,
                "input_data": input.to_string(),
                "status": "pending"
            }))],
        ))
    }

    fn executor(db: Arc<ScriptedDatabase>, tools: ToolRegistry) -> TaskExecutor {
        TaskExecutor::new(agent(), db, Arc::new(tools))
    }

    /// Tool registered as `http_request` that replies with a fixed result
    struct FixedHttpTool {
        reply: ToolResult,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FixedHttpTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: HTTP_TOOL.into(),
                description: "test http".into(),
                parameters: Vec::new(),
                category: None,
                has_side_effects: false,
            }
        }

        async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.log(HTTP_TOOL, &Value::Object(call.arguments.clone()), &self.reply.to_value(), Duration::ZERO, self.reply.success);
            Ok(self.reply.clone())
        }
    }

    fn http_registry(reply: ToolResult) -> (ToolRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tools = ToolRegistry::new();
        tools.register(FixedHttpTool {
            reply,
            calls: calls.clone(),
        });
        (tools, calls)
    }

    /// Simulated reasoning with a scripted plan and scripted step failures
    #[derive(Default)]
    struct ScriptedReasoner {
        plan: Option<Vec<PlanStep>>,
        /// (step id prefix, error message); first match wins
        failures: Vec<(&'static str, &'static str)>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedReasoner {
        fn failing(failures: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedReasoner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn think(&self, _agent: &Agent, task: &Task) -> Result<Thinking> {
            Ok(SimulatedReasoner::simulate_thinking(task))
        }

        async fn plan(&self, _agent: &Agent, task: &Task, thinking: &Thinking, _tools: &ToolRegistry) -> Result<Plan> {
            Ok(match &self.plan {
                Some(steps) => Plan::new(steps.clone()),
                None => SimulatedReasoner::simulate_planning(task, thinking),
            })
        }

        async fn execute_step(&self, _agent: &Agent, _task: &Task, step: &PlanStep) -> Result<Value> {
            self.calls.lock().unwrap().push(step.id.clone());
            match self.failures.iter().find(|(prefix, _)| step.id.starts_with(prefix)) {
                Some((_, message)) => Err(AgentError::Other((*message).into())),
                None => Ok(SimulatedReasoner::simulate_step_execution(step)),
            }
        }

        async fn compile(&self, _agent: &Agent, task: &Task, outputs: &[StepOutput]) -> Result<Value> {
            Ok(SimulatedReasoner::simulate_compilation(task, outputs))
        }
    }

    fn stats_params(db: &ScriptedDatabase) -> Vec<Value> {
        db.calls_matching(STATS_UPDATE)
            .into_iter()
            .map(|c| c.params[1].clone())
            .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_step_retries, 3);
        assert_eq!(config.base_backoff(), Duration::from_secs(1));
        assert_eq!(config.max_wait(), Duration::from_secs(300));
        assert!(config.parallel_steps);

        let parsed: ExecutorConfig = serde_json::from_value(json!({"max_plan_revisions": 10})).unwrap();
        assert_eq!(parsed.revision_limit(), MAX_PLAN_REVISIONS);
    }

    #[tokio::test]
    async fn test_generic_task_succeeds() {
        let db = db_with_task("Write a short greeting", json!({}));
        let mut executor = executor(db.clone(), ToolRegistry::new());

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(outcome.result["success"], json!(true));
        assert_eq!(outcome.result["verification"]["verified"], json!(true));
        assert_eq!(stats_params(&db), vec![json!(true)]);

        let finish = db.calls_matching(FINISH_UPDATE);
        assert_eq!(finish.len(), 1);
        assert_eq!(finish[0].params[1], json!("completed"));
        assert_eq!(db.calls_matching("INSERT INTO agent_task_steps").len(), 2);
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let db = Arc::new(ScriptedDatabase::new());
        let mut executor = executor(db.clone(), ToolRegistry::new());

        let err = executor.execute(7).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        assert!(db.calls_matching(STATS_UPDATE).is_empty());
    }

    #[tokio::test]
    async fn test_task_of_other_agent_rejected() {
        let db = Arc::new(ScriptedDatabase::new().on(
            TASK_QUERY,
            vec![row(json!({"id": 42, "agent_id": 2, "task_description": "x"}))],
        ));
        let mut executor = executor(db, ToolRegistry::new());
        assert!(matches!(executor.execute(42).await, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_memory_populated_after_run() {
        let db = db_with_task("Write a short greeting", json!({}));
        let mut executor = executor(db, ToolRegistry::new());
        executor.execute(42).await.unwrap();

        let ctx = executor.context_mut();
        assert_eq!(ctx.short_term_memory().len(), 2);
        assert_eq!(ctx.working_memory()["last_step"], json!("format"));
        assert_eq!(ctx.retrieve_long_term_memory("step:format").unwrap()["formatted"], json!(true));
        assert!(ctx.history().iter().any(|e| e.phase == Phase::Verifying));
    }

    #[tokio::test]
    async fn test_parallel_outputs_compiled_in_plan_order() {
        let db = db_with_task("Research async runtimes", json!({}));
        let mut executor = executor(db, ToolRegistry::new());

        let outcome = executor.execute(42).await.unwrap();
        assert!(outcome.success);

        let order: Vec<&str> = outcome.result["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["step_id"].as_str().unwrap())
            .collect();
        assert_eq!(order, ["research_primary", "research_secondary", "analyze", "format"]);
    }

    #[tokio::test]
    async fn test_url_step_dispatched_to_tool() {
        let db = db_with_task("Summarize the page", json!({"url": "https://example.com"}));
        let (tools, calls) = http_registry(ToolResult::success(HTTP_TOOL, "ok").with_data(json!({"status": 200})));
        let mut executor = executor(db.clone(), tools);

        let outcome = executor.execute(42).await.unwrap();
        assert!(outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.context().get_tool_logs(10).len(), 1);

        let step = &db.calls_matching("INSERT INTO agent_task_steps")[0];
        assert_eq!(step.params[3], json!(HTTP_TOOL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_url_replans_to_research() {
        let db = db_with_task("Summarize the page", json!({"url": "http://192.168.1.1/api"}));
        let (tools, calls) =
            http_registry(ToolResult::failure(HTTP_TOOL, "Access to internal URLs is not allowed"));
        let mut executor = executor(db.clone(), tools);

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.plan_revisions, 1);
        assert_eq!(executor.error_history().len(), 3);
        assert_eq!(executor.error_history()[2].action, "replan");
        assert!(executor.current_plan().unwrap().step("fallback_fetch").is_some());
        assert_eq!(stats_params(&db), vec![json!(true)]);
    }

    #[tokio::test]
    async fn test_auth_error_aborts_task() {
        let db = db_with_task("Summarize the page", json!({"url": "https://example.com/private"}));
        let (tools, calls) = http_registry(ToolResult::failure(HTTP_TOOL, "HTTP 401 Unauthorized"));
        let mut executor = executor(db.clone(), tools);

        let outcome = executor.execute(42).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result["success"], json!(false));
        assert!(outcome.error.unwrap().contains("401"));
        assert_eq!(executor.error_history()[0].kind, ErrorKind::AuthError);
        assert_eq!(stats_params(&db), vec![json!(false)]);
        assert_eq!(db.calls_matching(FINISH_UPDATE)[0].params[1], json!("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_exhausts_revisions() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = ScriptedReasoner::failing(vec![("", "service exploded")]);
        let mut executor = executor(db.clone(), ToolRegistry::new()).with_reasoner(Arc::new(reasoner));

        let outcome = executor.execute(42).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.plan_revisions, MAX_PLAN_REVISIONS);
        assert_eq!(outcome.result["plan_revisions"], json!(3));
        assert!(outcome.result["error_history"].as_array().unwrap().len() >= 4);
        assert_eq!(stats_params(&db), vec![json!(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_injects_wait_step() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = ScriptedReasoner::failing(vec![("execute", "429 rate limit, retry after 2 seconds")]);
        let mut executor = executor(db, ToolRegistry::new()).with_reasoner(Arc::new(reasoner));

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.plan_revisions, 1);
        let plan = executor.current_plan().unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["wait_execute", "retry_execute", "format"]);
        assert_eq!(plan.steps[0].params["duration_ms"], json!(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_in_parallel_group_is_not_rerun() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = Arc::new(ScriptedReasoner {
            plan: Some(vec![
                PlanStep::new("fetch", "research", "Fetch notes").parallel(),
                PlanStep::new("auth", "research", "Read private notes").parallel(),
            ]),
            ..ScriptedReasoner::failing(vec![("fetch", "boom"), ("auth", "401 unauthorized")])
        });
        let mut executor = executor(db.clone(), ToolRegistry::new()).with_reasoner(reasoner.clone());

        let outcome = executor.execute(42).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("'auth' aborted"));
        assert_eq!(outcome.plan_revisions, 0);
        assert_eq!(reasoner.calls().iter().filter(|id| *id == "auth").count(), 1);
        assert!(!reasoner.calls().iter().any(|id| id == "retry_fetch"));
        assert_eq!(stats_params(&db), vec![json!(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_failed_step_in_group_is_replanned() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = Arc::new(ScriptedReasoner {
            plan: Some(vec![
                PlanStep::new("left", "research", "Left half").parallel(),
                PlanStep::new("right", "research", "Right half").parallel(),
            ]),
            ..ScriptedReasoner::failing(vec![("left", "boom"), ("right", "boom")])
        });
        let mut executor = executor(db, ToolRegistry::new()).with_reasoner(reasoner.clone());

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.plan_revisions, 2);
        let plan = executor.current_plan().unwrap();
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["retry_left", "retry_right"]);
        let calls = reasoner.calls();
        assert_eq!(calls.iter().filter(|id| *id == "left").count(), 3);
        assert_eq!(calls.iter().filter(|id| *id == "right").count(), 3);
    }

    #[tokio::test]
    async fn test_forward_dependency_executes_in_order() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = Arc::new(ScriptedReasoner {
            plan: Some(vec![
                PlanStep::new("summarize", "analyze", "Summarize").depends_on(["gather"]),
                PlanStep::new("gather", "research", "Gather"),
            ]),
            ..ScriptedReasoner::default()
        });
        let mut executor = executor(db, ToolRegistry::new()).with_reasoner(reasoner.clone());

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(reasoner.calls(), ["gather", "summarize"]);
    }

    #[tokio::test]
    async fn test_duplicate_step_ids_fail_task() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = ScriptedReasoner {
            plan: Some(vec![PlanStep::new("s1", "research", "A"), PlanStep::new("s1", "analyze", "B")]),
            ..ScriptedReasoner::default()
        };
        let mut executor = executor(db.clone(), ToolRegistry::new()).with_reasoner(Arc::new(reasoner));

        let outcome = executor.execute(42).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Duplicate plan step id"));
        assert_eq!(stats_params(&db), vec![json!(false)]);
    }

    #[tokio::test]
    async fn test_empty_plan_compiles_to_success() {
        let db = db_with_task("Nothing to do", json!({}));
        let reasoner = ScriptedReasoner {
            plan: Some(Vec::new()),
            ..ScriptedReasoner::default()
        };
        let mut executor = executor(db.clone(), ToolRegistry::new()).with_reasoner(Arc::new(reasoner));

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.steps_executed, 0);
        assert_eq!(outcome.result["summary"], json!("No results were produced"));
        assert_eq!(stats_params(&db), vec![json!(true)]);
    }

    #[tokio::test]
    async fn test_cleared_strategies_abort_on_first_failure() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = ScriptedReasoner::failing(vec![("execute", "boom")]);
        let mut executor = executor(db, ToolRegistry::new()).with_reasoner(Arc::new(reasoner));
        executor.clear_recovery_strategies();

        let outcome = executor.execute(42).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(executor.error_history().len(), 1);
        assert_eq!(executor.error_history()[0].action, "abort");
    }

    #[tokio::test]
    async fn test_custom_strategy_replaces_default() {
        let db = db_with_task("Write a short greeting", json!({}));
        let reasoner = ScriptedReasoner::failing(vec![("execute", "boom")]);
        let mut executor = executor(db, ToolRegistry::new()).with_reasoner(Arc::new(reasoner));
        executor.add_recovery_strategy(ErrorKind::Generic, |_: &FailureInfo| RecoveryAction::Replan);

        let outcome = executor.execute(42).await.unwrap();

        assert!(outcome.success);
        assert_eq!(executor.error_history().len(), 1);
        assert!(executor.current_plan().unwrap().step("retry_execute").is_some());
    }

    #[test]
    fn test_revise_plan_capped_at_three() {
        let mut executor = executor(Arc::new(ScriptedDatabase::new()), ToolRegistry::new());
        let step = PlanStep::new("step_1", "execute", "Do it");
        let failure = FailureInfo {
            step_id: "step_1".into(),
            kind: ErrorKind::Generic,
            message: "boom".into(),
            attempt: 3,
            wait_hint: None,
        };

        for _ in 0..3 {
            assert!(executor.revise_plan(&step, &failure).is_some());
        }
        assert!(executor.revise_plan(&step, &failure).is_none());
        assert_eq!(executor.plan_revisions(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_with_recovery_retries_then_succeeds() {
        struct FlakyTool {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Tool for FlakyTool {
            fn schema(&self) -> ToolSchema {
                ToolSchema {
                    name: "flaky".into(),
                    description: "fails twice".into(),
                    parameters: Vec::new(),
                    category: None,
                    has_side_effects: false,
                }
            }

            async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<ToolResult> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(AgentError::Other("connect ECONNREFUSED".into()));
                }
                Ok(ToolResult::success("flaky", "finally"))
            }
        }

        let mut tools = ToolRegistry::new();
        tools.register(FlakyTool { calls: AtomicUsize::new(0) });
        let mut executor = executor(Arc::new(ScriptedDatabase::new()), tools);
        let task = Task {
            id: 42,
            agent_id: 1,
            task_description: "x".into(),
            ..Task::default()
        };
        let step = PlanStep::new("s1", "call", "Call flaky").with_tool("flaky", json!({}));

        let output = executor.execute_step_with_recovery(&task, &step).await.unwrap();

        assert_eq!(output["output"], json!("finally"));
        assert_eq!(executor.error_history().len(), 2);
        assert!(executor.error_history().iter().all(|e| e.kind == ErrorKind::NetworkError));
    }

    #[test]
    fn test_verify_flags_failed_outputs() {
        let outputs = vec![
            StepOutput { step_id: "a".into(), action: "x".into(), output: json!({"ok": 1}) },
            StepOutput { step_id: "b".into(), action: "x".into(), output: json!({"success": false}) },
            StepOutput { step_id: "c".into(), action: "x".into(), output: Value::Null },
        ];
        let report = verify_outputs(&outputs);
        assert_eq!(report["verified"], json!(false));
        assert_eq!(report["issues"].as_array().unwrap().len(), 2);
        assert_eq!(report["checked"], json!(3));
    }
}
