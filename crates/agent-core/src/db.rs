//! Persistence Interface
//!
//! The engine talks to its relational store through a single parameterized
//! `query` call. Rows come back as JSON objects so that the same decoding
//! path serves every backend (Postgres in production, scripted doubles in tests).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// A single result row, column name to value
pub type Row = Map<String, Value>;

/// Result of a query
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// Returned rows (empty for statements without `RETURNING`)
    pub rows: Vec<Row>,

    /// Number of rows affected or returned
    pub row_count: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    /// First row, consuming the result
    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }
}

/// Relational store used for agents, tasks and task steps.
///
/// SQL uses Postgres positional parameters (`$1`, `$2`, ...).
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Release pooled connections; later queries may fail
    async fn close(&self) {}
}

/// Normalize a JSON column that may arrive serialized as text.
///
/// Strings are parsed; null, missing or unparseable values become `default`.
pub fn json_column(value: Option<&Value>, default: Value) -> Value {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Null) | Err(_) => default,
            Ok(parsed) => parsed,
        },
        Some(other) => other.clone(),
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-process database double.

    use std::sync::{Mutex, PoisonError};

    use super::{Database, QueryResult, Row};
    use crate::error::{AgentError, Result};
    use async_trait::async_trait;
    use serde_json::Value;

    /// A recorded query
    #[derive(Clone, Debug)]
    pub struct QueryCall {
        pub sql: String,
        pub params: Vec<Value>,
    }

    enum Reply {
        Rows(Vec<Row>),
        Fail(String),
    }

    struct Rule {
        pattern: String,
        reply: Reply,
        remaining: Option<usize>,
    }

    /// Answers queries from substring rules and records every call.
    ///
    /// Rules are checked in registration order; the first rule whose pattern
    /// occurs in the SQL text answers. Unmatched queries return no rows.
    #[derive(Default)]
    pub struct ScriptedDatabase {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<QueryCall>>,
    }

    impl ScriptedDatabase {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer every query containing `pattern` with `rows`
        pub fn on(self, pattern: &str, rows: Vec<Row>) -> Self {
            self.push(pattern, Reply::Rows(rows), None);
            self
        }

        /// Answer only the next query containing `pattern` with `rows`
        pub fn once(self, pattern: &str, rows: Vec<Row>) -> Self {
            self.push(pattern, Reply::Rows(rows), Some(1));
            self
        }

        /// Fail every query containing `pattern`
        pub fn fail_on(self, pattern: &str, message: &str) -> Self {
            self.push(pattern, Reply::Fail(message.to_string()), None);
            self
        }

        fn push(&self, pattern: &str, reply: Reply, remaining: Option<usize>) {
            self.rules
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Rule { pattern: pattern.to_string(), reply, remaining });
        }

        /// All recorded calls
        pub fn calls(&self) -> Vec<QueryCall> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Recorded calls whose SQL contains `pattern`
        pub fn calls_matching(&self, pattern: &str) -> Vec<QueryCall> {
            self.calls()
                .into_iter()
                .filter(|c| c.sql.contains(pattern))
                .collect()
        }
    }

    #[async_trait]
    impl Database for ScriptedDatabase {
        async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(QueryCall { sql: sql.to_string(), params: params.to_vec() });

            let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(idx) = rules
                .iter()
                .position(|r| r.remaining != Some(0) && sql.contains(&r.pattern))
            else {
                return Ok(QueryResult::default());
            };

            let rule = &mut rules[idx];
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            match &rule.reply {
                Reply::Rows(rows) => Ok(QueryResult::from_rows(rows.clone())),
                Reply::Fail(msg) => Err(AgentError::Database(msg.clone())),
            }
        }
    }

    /// Build a row from a JSON object literal
    pub fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }
}
