//! Tool Execution Log
//!
//! A bounded, redacted record of every tool call made during a task run.
//! Sensitive fields are replaced before an entry is stored, so the buffer
//! can be surfaced in task results and debug output as-is.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::RingBuffer;

/// Maximum number of retained tool log entries
pub const TOOL_LOG_CAPACITY: usize = 100;

/// Replacement for sensitive values
pub const REDACTED: &str = "[REDACTED]";

const MAX_SANITIZE_DEPTH: usize = 4;

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "api_key",
    "apikey",
    "token",
    "authorization",
    "credential",
    "private_key",
];

/// One recorded tool call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolLogEntry {
    pub tool: String,
    pub input: Value,
    pub output: Value,
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Shared handle to a bounded tool log.
///
/// Clones share the same buffer; the executor hands a clone to every tool
/// call so concurrently running steps append to one log.
#[derive(Clone, Debug)]
pub struct ToolLog {
    entries: Arc<Mutex<RingBuffer<ToolLogEntry>>>,
}

impl Default for ToolLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolLog {
    pub fn new() -> Self {
        Self::with_capacity(TOOL_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    /// Append a redacted entry, evicting the oldest when full
    pub fn record(&self, tool: &str, input: &Value, output: &Value, duration_ms: u64, success: bool) {
        let entry = ToolLogEntry {
            tool: tool.to_string(),
            input: sanitize_for_log(input),
            output: sanitize_for_log(output),
            duration_ms,
            success,
            timestamp: Utc::now(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// The most recent `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<ToolLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(n)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Replace values of password/api-key/token-like keys with `[REDACTED]`.
///
/// Nested objects and arrays are walked up to a small fixed depth; anything
/// deeper is dropped rather than logged unchecked.
pub fn sanitize_for_log(data: &Value) -> Value {
    sanitize_value(data, 0)
}

fn sanitize_value(data: &Value, depth: usize) -> Value {
    match data {
        Value::Object(map) if depth >= MAX_SANITIZE_DEPTH && !map.is_empty() => {
            Value::String("[MAX_DEPTH]".into())
        }
        Value::Object(map) => {
            let sanitized: Map<String, Value> = map
                .iter()
                .map(|(key, value)| {
                    let value = if is_sensitive(key) {
                        Value::String(REDACTED.into())
                    } else {
                        sanitize_value(value, depth + 1)
                    };
                    (key.clone(), value)
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) if depth >= MAX_SANITIZE_DEPTH && !items.is_empty() => {
            Value::String("[MAX_DEPTH]".into())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_value(v, depth + 1)).collect()),
        other => other.clone(),
    }
}
