//! Plans and Replanning
//!
//! A plan is an ordered list of steps with declared dependencies. Steps that
//! are marked parallel and whose dependencies are already satisfied are
//! grouped so the executor can dispatch them together.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::recovery::ErrorKind;
use crate::error::{AgentError, Result};

/// Hard ceiling on plan revisions per execution
pub const MAX_PLAN_REVISIONS: u32 = 3;

/// Tool name of the built-in HTTP tool
pub const HTTP_TOOL: &str = "http_request";

/// Action handled by the executor itself: sleep for `params.duration_ms`
pub const WAIT_ACTION: &str = "wait";

/// One planned unit of work
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "canRunInParallel")]
    pub can_run_in_parallel: bool,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            tool: None,
            description: description.into(),
            params: Value::Null,
            dependencies: Vec::new(),
            can_run_in_parallel: false,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>, params: Value) -> Self {
        self.tool = Some(tool.into());
        self.params = params;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn parallel(mut self) -> Self {
        self.can_run_in_parallel = true;
        self
    }

    /// Name looked up in the tool registry: the explicit tool, else the action
    pub fn tool_name(&self) -> &str {
        self.tool.as_deref().unwrap_or(&self.action)
    }

    fn url_param(&self) -> Option<&str> {
        self.params.get("url").and_then(Value::as_str)
    }
}

/// Ordered steps for one task attempt
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub revision: u32,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        let estimated_duration_ms = steps.len() as u64 * 2000;
        Self {
            steps,
            estimated_duration_ms,
            revision: 0,
        }
    }

    /// Plan with its steps checked and put in dependency order.
    ///
    /// Fails on duplicate step ids and on dependency cycles.
    pub fn ordered(steps: Vec<PlanStep>) -> Result<Self> {
        Self::new(steps).into_ordered()
    }

    pub fn into_ordered(mut self) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(dup) = self.steps.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(AgentError::validation(format!("Duplicate plan step id '{}'", dup.id)));
        }

        let order = execution_order(&self.steps)
            .ok_or_else(|| AgentError::validation("Plan step dependencies form a cycle"))?;
        let mut slots: Vec<Option<PlanStep>> = self.steps.into_iter().map(Some).collect();
        self.steps = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(self)
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Replace step `id` with `replacements`, in place.
    ///
    /// The first replacement inherits the failed step's dependencies and later
    /// steps that depended on it now depend on the last replacement.
    pub fn replace_step(&mut self, id: &str, mut replacements: Vec<PlanStep>) -> bool {
        let Some(pos) = self.steps.iter().position(|s| s.id == id) else {
            return false;
        };
        let failed = self.steps.remove(pos);

        if let Some(first) = replacements.first_mut() {
            for dep in &failed.dependencies {
                if !first.dependencies.contains(dep) {
                    first.dependencies.push(dep.clone());
                }
            }
        }

        if let Some(last) = replacements.last().map(|s| s.id.clone()) {
            for step in &mut self.steps[pos..] {
                for dep in &mut step.dependencies {
                    if dep == id {
                        dep.clone_from(&last);
                    }
                }
            }
        }

        self.estimated_duration_ms = self
            .estimated_duration_ms
            .saturating_add(replacements.len() as u64 * 2000)
            .saturating_sub(2000);
        self.steps.splice(pos..pos, replacements);
        true
    }
}

/// Step indices ordered so every step comes after the steps it depends on.
///
/// Plan order is kept wherever dependencies allow. Dependencies on steps
/// outside `steps` count as satisfied. Returns `None` on a cycle.
pub fn execution_order(steps: &[PlanStep]) -> Option<Vec<usize>> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<usize> = (0..steps.len()).collect();
    let mut order = Vec::with_capacity(steps.len());

    while !remaining.is_empty() {
        let pos = remaining.iter().position(|&i| {
            steps[i]
                .dependencies
                .iter()
                .all(|d| placed.contains(d.as_str()) || !known.contains(d.as_str()))
        })?;
        let idx = remaining.remove(pos);
        placed.insert(steps[idx].id.as_str());
        order.push(idx);
    }
    Some(order)
}

/// Greedily cluster steps into execution groups, in dependency order.
///
/// A step joins the current group when it and every member are parallel and
/// none of its dependencies is still pending; otherwise it opens a new group.
/// Dependencies on steps outside `steps` count as satisfied.
pub fn identify_parallel_groups(steps: &[PlanStep]) -> Vec<Vec<usize>> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let order = execution_order(steps).unwrap_or_else(|| (0..steps.len()).collect());
    let mut done: HashSet<&str> = HashSet::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for idx in order {
        let step = &steps[idx];
        let deps_ready = step
            .dependencies
            .iter()
            .all(|d| done.contains(d.as_str()) || !known.contains(d.as_str()));
        let joinable = step.can_run_in_parallel
            && deps_ready
            && current.iter().all(|&i| steps[i].can_run_in_parallel);

        if !current.is_empty() && !joinable {
            done.extend(current.iter().map(|&i| steps[i].id.as_str()));
            groups.push(std::mem::take(&mut current));
        }
        current.push(idx);
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Alternative steps for a step that failed irrecoverably
pub fn generate_alternative_steps(failed: &PlanStep, kind: ErrorKind, wait: Duration) -> Vec<PlanStep> {
    let retry_id = format!("retry_{}", failed.id);

    if kind == ErrorKind::RateLimit {
        let wait_id = format!("wait_{}", failed.id);
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        let wait_step = PlanStep {
            params: json!({ "duration_ms": wait_ms }),
            ..PlanStep::new(&wait_id, WAIT_ACTION, "Wait for rate limit to reset")
        };
        let retry = PlanStep {
            id: retry_id,
            dependencies: vec![wait_id],
            can_run_in_parallel: false,
            ..failed.clone()
        };
        return vec![wait_step, retry];
    }

    let tool = failed.tool_name();
    let browser_like = tool == "browser" || failed.action.contains("browse") || failed.action.contains("scrape");

    if browser_like {
        if let Some(url) = failed.url_param() {
            return vec![PlanStep::new(
                format!("fallback_{}", failed.id),
                "fetch",
                format!("Fetch page directly: {}", failed.description),
            )
            .with_tool(HTTP_TOOL, json!({ "method": "GET", "url": url }))];
        }
    }

    if tool == HTTP_TOOL {
        let mut step = PlanStep::new(
            format!("fallback_{}", failed.id),
            "research",
            format!("Gather the information without a direct request: {}", failed.description),
        );
        step.params = json!({ "original_url": failed.url_param() });
        return vec![step];
    }

    vec![PlanStep {
        id: retry_id,
        description: format!("Retry: {}", failed.description),
        can_run_in_parallel: false,
        ..failed.clone()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(steps: &[PlanStep], groups: &[Vec<usize>]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|&i| steps[i].id.clone()).collect())
            .collect()
    }

    #[test]
    fn test_parallel_groups() {
        let steps = vec![
            PlanStep::new("a", "research", "").parallel(),
            PlanStep::new("b", "research", "").parallel(),
            PlanStep::new("c", "analyze", "").depends_on(["a", "b"]),
            PlanStep::new("d", "format", "").depends_on(["c"]),
        ];
        let groups = identify_parallel_groups(&steps);
        assert_eq!(ids(&steps, &groups), vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
    }

    #[test]
    fn test_forward_dependency_runs_first() {
        let steps = vec![
            PlanStep::new("b", "analyze", "").depends_on(["a"]),
            PlanStep::new("a", "research", ""),
        ];
        let groups = identify_parallel_groups(&steps);
        assert_eq!(ids(&steps, &groups), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_ordered_plan_reorders_steps() {
        let plan = Plan::ordered(vec![
            PlanStep::new("format", "format", "").depends_on(["analyze"]),
            PlanStep::new("analyze", "analyze", "").depends_on(["fetch"]),
            PlanStep::new("fetch", "fetch", ""),
            PlanStep::new("notes", "research", ""),
        ])
        .unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, ["fetch", "analyze", "format", "notes"]);
    }

    #[test]
    fn test_ordered_plan_rejects_duplicate_ids() {
        let err = Plan::ordered(vec![PlanStep::new("a", "research", ""), PlanStep::new("a", "analyze", "")])
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_ordered_plan_rejects_cycles() {
        let err = Plan::ordered(vec![
            PlanStep::new("a", "research", "").depends_on(["b"]),
            PlanStep::new("b", "analyze", "").depends_on(["a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert!(execution_order(&[PlanStep::new("x", "x", "").depends_on(["x"])]).is_none());
    }

    #[test]
    fn test_dependent_parallel_steps_serialize() {
        let steps = vec![
            PlanStep::new("a", "research", "").parallel(),
            PlanStep::new("b", "research", "").parallel().depends_on(["a"]),
            PlanStep::new("c", "research", "").parallel(),
        ];
        let groups = identify_parallel_groups(&steps);
        assert_eq!(ids(&steps, &groups), vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn test_external_dependencies_are_satisfied() {
        let steps = vec![
            PlanStep::new("x", "research", "").parallel().depends_on(["done_earlier"]),
            PlanStep::new("y", "research", "").parallel(),
        ];
        assert_eq!(identify_parallel_groups(&steps), vec![vec![0, 1]]);
        assert!(identify_parallel_groups(&[]).is_empty());
    }

    #[test]
    fn test_rate_limit_alternatives_inject_wait() {
        let failed = PlanStep::new("fetch", "fetch", "Fetch prices")
            .with_tool(HTTP_TOOL, json!({"url": "https://api.example.com"}));
        let steps = generate_alternative_steps(&failed, ErrorKind::RateLimit, Duration::from_secs(60));

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, WAIT_ACTION);
        assert_eq!(steps[0].params["duration_ms"], json!(60_000));
        assert_eq!(steps[1].id, "retry_fetch");
        assert_eq!(steps[1].dependencies, vec!["wait_fetch"]);
        assert_eq!(steps[1].tool.as_deref(), Some(HTTP_TOOL));
    }

    #[test]
    fn test_browser_falls_back_to_http() {
        let failed = PlanStep::new("open", "browse", "Open docs")
            .with_tool("browser", json!({"url": "https://docs.example.com"}));
        let steps = generate_alternative_steps(&failed, ErrorKind::Generic, Duration::ZERO);

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tool.as_deref(), Some(HTTP_TOOL));
        assert_eq!(steps[0].params["url"], json!("https://docs.example.com"));
    }

    #[test]
    fn test_http_falls_back_to_research() {
        let failed = PlanStep::new("fetch", "fetch", "Fetch page")
            .with_tool(HTTP_TOOL, json!({"url": "https://example.com/missing"}));
        let steps = generate_alternative_steps(&failed, ErrorKind::NotFound, Duration::ZERO);
        assert_eq!(steps[0].action, "research");
        assert!(steps[0].tool.is_none());
    }

    #[test]
    fn test_generic_alternative_is_retry() {
        let failed = PlanStep::new("step_1", "execute", "Do the thing");
        let steps = generate_alternative_steps(&failed, ErrorKind::Generic, Duration::ZERO);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, "retry_step_1");
        assert_eq!(steps[0].action, "execute");
    }

    #[test]
    fn test_replace_step_rewires_dependencies() {
        let mut plan = Plan::new(vec![
            PlanStep::new("a", "research", ""),
            PlanStep::new("b", "fetch", "").depends_on(["a"]),
            PlanStep::new("c", "format", "").depends_on(["b"]),
        ]);
        let replacements = vec![
            PlanStep::new("wait_b", WAIT_ACTION, ""),
            PlanStep::new("retry_b", "fetch", "").depends_on(["wait_b"]),
        ];

        assert!(plan.replace_step("b", replacements));
        let order: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, ["a", "wait_b", "retry_b", "c"]);
        assert_eq!(plan.step("wait_b").unwrap().dependencies, vec!["a"]);
        assert_eq!(plan.step("c").unwrap().dependencies, vec!["retry_b"]);
        assert!(!plan.replace_step("missing", Vec::new()));
    }

    #[test]
    fn test_plan_step_parses_camel_case_flag() {
        let step: PlanStep = serde_json::from_value(json!({
            "id": "s1", "action": "research", "canRunInParallel": true
        }))
        .unwrap();
        assert!(step.can_run_in_parallel);
        assert_eq!(step.tool_name(), "research");
    }
}
