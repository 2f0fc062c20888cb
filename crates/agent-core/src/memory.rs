//! Execution Memory
//!
//! Per-run state owned by one `TaskExecutor`: notes, the cognitive-loop
//! history, layered memory (short-term, long-term, working) and the tool log.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::log::{ToolLog, ToolLogEntry};

/// Maximum number of short-term memory entries
pub const SHORT_TERM_CAPACITY: usize = 10;

/// Number of short-term entries returned by `get_relevant_context`
const RELEVANT_RECENT: usize = 5;

/// Fixed-capacity FIFO buffer; the oldest entry is dropped on overflow
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// The most recent `n` items, oldest first
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Cognitive loop state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Thinking,
    Planning,
    Executing,
    Verifying,
    Completed,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Thinking => "thinking",
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Verifying => "verifying",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry in the run history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub phase: Phase,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

/// A short-term memory item
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// A long-term memory entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LongTermEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Result of `ExecutionContext::get_relevant_context`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelevantContext {
    pub recent: Vec<MemoryItem>,
    pub long_term: Vec<(String, Value)>,
}

/// Per-execution state; never shared between task runs
#[derive(Debug)]
pub struct ExecutionContext {
    /// Free-form notes
    pub notes: Map<String, Value>,
    history: Vec<HistoryEvent>,
    short_term: RingBuffer<MemoryItem>,
    long_term: HashMap<String, LongTermEntry>,
    working: Map<String, Value>,
    tool_logs: ToolLog,
    plan_revisions: u32,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            notes: Map::new(),
            history: Vec::new(),
            short_term: RingBuffer::new(SHORT_TERM_CAPACITY),
            long_term: HashMap::new(),
            working: Map::new(),
            tool_logs: ToolLog::new(),
            plan_revisions: 0,
        }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn record_event(&mut self, phase: Phase, detail: Value) {
        self.history.push(HistoryEvent {
            phase,
            detail,
            timestamp: Utc::now(),
        });
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn add_to_short_term_memory(&mut self, item: Value) {
        self.short_term.push(MemoryItem {
            data: item,
            timestamp: Utc::now(),
        });
    }

    pub fn short_term_memory(&self) -> Vec<MemoryItem> {
        self.short_term.iter().cloned().collect()
    }

    pub fn store_long_term_memory(&mut self, key: impl Into<String>, value: Value) {
        self.long_term.insert(
            key.into(),
            LongTermEntry {
                value,
                stored_at: Utc::now(),
                access_count: 0,
            },
        );
    }

    /// Look up a long-term entry, counting the access
    pub fn retrieve_long_term_memory(&mut self, key: &str) -> Option<Value> {
        let entry = self.long_term.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    pub fn long_term_entry(&self, key: &str) -> Option<&LongTermEntry> {
        self.long_term.get(key)
    }

    pub fn update_working_memory(&mut self, key: impl Into<String>, value: Value) {
        self.working.insert(key.into(), value);
    }

    pub fn working_memory(&self) -> &Map<String, Value> {
        &self.working
    }

    pub fn clear_working_memory(&mut self) {
        self.working.clear();
    }

    /// Recent short-term entries plus long-term entries whose key contains
    /// `search_term` (case-insensitive). No term means no long-term matches.
    pub fn get_relevant_context(&self, search_term: Option<&str>) -> RelevantContext {
        let long_term = match search_term.map(str::to_lowercase) {
            Some(term) if !term.is_empty() => {
                let mut matches: Vec<(String, Value)> = self
                    .long_term
                    .iter()
                    .filter(|(key, _)| key.to_lowercase().contains(&term))
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect();
                matches.sort_by(|a, b| a.0.cmp(&b.0));
                matches
            }
            _ => Vec::new(),
        };

        RelevantContext {
            recent: self.short_term.recent(RELEVANT_RECENT),
            long_term,
        }
    }

    // ------------------------------------------------------------------
    // Tool log
    // ------------------------------------------------------------------

    /// Handle passed to tools so they can append to this run's log
    pub fn tool_log(&self) -> ToolLog {
        self.tool_logs.clone()
    }

    pub fn log_tool_execution(&self, tool: &str, input: &Value, output: &Value, duration_ms: u64, success: bool) {
        self.tool_logs.record(tool, input, output, duration_ms, success);
    }

    pub fn get_tool_logs(&self, n: usize) -> Vec<ToolLogEntry> {
        self.tool_logs.recent(n)
    }

    // ------------------------------------------------------------------
    // Plan revisions
    // ------------------------------------------------------------------

    pub fn plan_revisions(&self) -> u32 {
        self.plan_revisions
    }

    pub(crate) fn bump_plan_revisions(&mut self) -> u32 {
        self.plan_revisions += 1;
        self.plan_revisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_short_term_memory_is_bounded() {
        let mut ctx = ExecutionContext::new();
        for i in 0..25 {
            ctx.add_to_short_term_memory(json!({"i": i}));
            assert!(ctx.short_term_memory().len() <= SHORT_TERM_CAPACITY);
        }

        let items = ctx.short_term_memory();
        assert_eq!(items.len(), SHORT_TERM_CAPACITY);
        assert_eq!(items[0].data, json!({"i": 15}));
        assert_eq!(items[9].data, json!({"i": 24}));
    }

    #[test]
    fn test_long_term_access_count() {
        let mut ctx = ExecutionContext::new();
        ctx.store_long_term_memory("user_pref", json!("dark"));

        assert_eq!(ctx.retrieve_long_term_memory("user_pref"), Some(json!("dark")));
        assert_eq!(ctx.long_term_entry("user_pref").unwrap().access_count, 1);
        ctx.retrieve_long_term_memory("user_pref");
        assert_eq!(ctx.long_term_entry("user_pref").unwrap().access_count, 2);

        assert_eq!(ctx.retrieve_long_term_memory("missing"), None);
    }

    #[test]
    fn test_working_memory_clear() {
        let mut ctx = ExecutionContext::new();
        ctx.update_working_memory("current_step", json!("research"));
        assert_eq!(ctx.working_memory().get("current_step"), Some(&json!("research")));

        ctx.clear_working_memory();
        assert!(ctx.working_memory().is_empty());
    }

    #[test]
    fn test_relevant_context() {
        let mut ctx = ExecutionContext::new();
        for i in 0..8 {
            ctx.add_to_short_term_memory(json!(i));
        }
        ctx.store_long_term_memory("Pricing_Page", json!(1));
        ctx.store_long_term_memory("pricing_api", json!(2));
        ctx.store_long_term_memory("team", json!(3));

        let found = ctx.get_relevant_context(Some("PRICING"));
        assert_eq!(found.recent.len(), 5);
        assert_eq!(found.recent[4].data, json!(7));
        assert_eq!(found.long_term.len(), 2);

        let none = ctx.get_relevant_context(None);
        assert!(none.long_term.is_empty());
        assert_eq!(none.recent.len(), 5);
    }

    #[test]
    fn test_ring_buffer_zero_capacity() {
        let mut buf: RingBuffer<u8> = RingBuffer::new(0);
        buf.push(1);
        assert!(buf.is_empty());
    }
}
