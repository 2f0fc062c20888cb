//! SQL Query Builder
//!
//! Builds parameterized Postgres statements from structured requests and
//! screens raw SQL before it reaches a pool.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Result, ToolError};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

static RESTRICTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(DROP|TRUNCATE)\b").expect("restricted pattern is valid"));

/// Operators accepted in structured filters
const FILTER_OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "ILIKE", "NOT LIKE", "IN", "NOT IN", "IS NULL", "IS NOT NULL",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOp {
    Select,
    Insert,
    Update,
    Delete,
}

impl QueryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryOp::Select => "SELECT",
            QueryOp::Insert => "INSERT",
            QueryOp::Update => "UPDATE",
            QueryOp::Delete => "DELETE",
        }
    }
}

/// Structured statement description
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    pub table: String,
    pub columns: Vec<String>,
    #[serde(rename = "where")]
    pub filter: Map<String, Value>,
    pub values: Map<String, Value>,
    #[serde(alias = "orderBy")]
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Quote a table or column name. Dotted names quote each part.
pub fn escape_identifier(name: &str) -> Result<String> {
    let name = name.trim();
    let parts: Vec<&str> = name.split('.').collect();
    if name.is_empty() || parts.len() > 2 || !parts.iter().all(|p| IDENTIFIER.is_match(p)) {
        return Err(ToolError::InvalidIdentifier(name.to_string()));
    }
    Ok(parts.iter().map(|p| format!("\"{p}\"")).collect::<Vec<_>>().join("."))
}

fn placeholder(params: &[Value]) -> String {
    format!("${}", params.len())
}

/// Build `"a" = $1 AND "b" IS NULL ...` from a filter map.
///
/// Plain values compare for equality, `null` becomes `IS NULL`, and
/// `{"op": ">", "value": 3}` applies an explicit operator. Placeholders
/// continue from the parameters already in `params`.
pub fn build_where_clause(filter: &Map<String, Value>, params: &mut Vec<Value>) -> Result<String> {
    let mut conditions = Vec::with_capacity(filter.len());

    for (column, condition) in filter {
        let column = escape_identifier(column)?;
        let clause = match condition {
            Value::Null => format!("{column} IS NULL"),
            Value::Object(spec) if spec.contains_key("op") || spec.contains_key("operator") => {
                operator_clause(&column, spec, params)?
            }
            value => {
                params.push(value.clone());
                format!("{column} = {}", placeholder(params))
            }
        };
        conditions.push(clause);
    }

    Ok(conditions.join(" AND "))
}

fn operator_clause(column: &str, spec: &Map<String, Value>, params: &mut Vec<Value>) -> Result<String> {
    let op = spec
        .get("op")
        .or_else(|| spec.get("operator"))
        .and_then(Value::as_str)
        .map(|op| op.trim().to_uppercase())
        .unwrap_or_default();

    if !FILTER_OPERATORS.contains(&op.as_str()) {
        return Err(ToolError::InvalidParams(format!("Unsupported operator: {op}")));
    }

    match op.as_str() {
        "IS NULL" | "IS NOT NULL" => Ok(format!("{column} {op}")),
        "IN" | "NOT IN" => {
            let values = spec
                .get("value")
                .and_then(Value::as_array)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ToolError::InvalidParams(format!("{op} requires a non-empty array")))?;
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| {
                    params.push(v.clone());
                    placeholder(params)
                })
                .collect();
            Ok(format!("{column} {op} ({})", placeholders.join(", ")))
        }
        _ => {
            let value = spec.get("value").cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Err(ToolError::InvalidParams(format!("{op} requires a value")));
            }
            params.push(value);
            Ok(format!("{column} {op} {}", placeholder(params)))
        }
    }
}

fn order_clause(order_by: &str) -> Result<String> {
    let mut parts = order_by.split_whitespace();
    let column = escape_identifier(parts.next().unwrap_or_default())?;
    let direction = match parts.next().map(str::to_uppercase).as_deref() {
        None | Some("ASC") => "ASC",
        Some("DESC") => "DESC",
        Some(other) => return Err(ToolError::InvalidParams(format!("Invalid sort direction: {other}"))),
    };
    if parts.next().is_some() {
        return Err(ToolError::InvalidParams(format!("Invalid order_by: {order_by}")));
    }
    Ok(format!(" ORDER BY {column} {direction}"))
}

/// Build a parameterized statement for a structured request
pub fn build_query(op: QueryOp, spec: &QuerySpec) -> Result<(String, Vec<Value>)> {
    let table = escape_identifier(&spec.table)?;
    let mut params = Vec::new();

    let sql = match op {
        QueryOp::Select => {
            let columns = if spec.columns.is_empty() || spec.columns.iter().any(|c| c == "*") {
                "*".to_string()
            } else {
                spec.columns
                    .iter()
                    .map(|c| escape_identifier(c))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ")
            };
            let mut sql = format!("SELECT {columns} FROM {table}");
            let filter = build_where_clause(&spec.filter, &mut params)?;
            if !filter.is_empty() {
                sql.push_str(&format!(" WHERE {filter}"));
            }
            if let Some(order_by) = spec.order_by.as_deref().filter(|o| !o.trim().is_empty()) {
                sql.push_str(&order_clause(order_by)?);
            }
            if let Some(limit) = spec.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = spec.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
            sql
        }
        QueryOp::Insert => {
            if spec.values.is_empty() {
                return Err(ToolError::InvalidParams("INSERT requires values".into()));
            }
            let mut columns = Vec::with_capacity(spec.values.len());
            let mut placeholders = Vec::with_capacity(spec.values.len());
            for (column, value) in &spec.values {
                columns.push(escape_identifier(column)?);
                params.push(value.clone());
                placeholders.push(placeholder(&params));
            }
            format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
                columns.join(", "),
                placeholders.join(", ")
            )
        }
        QueryOp::Update => {
            if spec.values.is_empty() {
                return Err(ToolError::InvalidParams("UPDATE requires values".into()));
            }
            let mut assignments = Vec::with_capacity(spec.values.len());
            for (column, value) in &spec.values {
                let column = escape_identifier(column)?;
                params.push(value.clone());
                assignments.push(format!("{column} = {}", placeholder(&params)));
            }
            let filter = build_where_clause(&spec.filter, &mut params)?;
            if filter.is_empty() {
                return Err(ToolError::QueryRejected("UPDATE without a WHERE clause".into()));
            }
            format!("UPDATE {table} SET {} WHERE {filter} RETURNING *", assignments.join(", "))
        }
        QueryOp::Delete => {
            let filter = build_where_clause(&spec.filter, &mut params)?;
            if filter.is_empty() {
                return Err(ToolError::QueryRejected("DELETE without a WHERE clause".into()));
            }
            format!("DELETE FROM {table} WHERE {filter} RETURNING *")
        }
    };

    Ok((sql, params))
}

/// Screen raw SQL.
///
/// Rejects multiple statements, and DROP/TRUNCATE unless the caller lists
/// that operation in `allowed_operations`.
pub fn validate_query(sql: &str, allowed_operations: &[String]) -> Result<()> {
    let statement = sql.trim().trim_end_matches(';').trim_end();
    if statement.is_empty() {
        return Err(ToolError::InvalidParams("Query is empty".into()));
    }
    if statement.contains(';') {
        return Err(ToolError::QueryRejected("Multiple statements are not allowed".into()));
    }

    for found in RESTRICTED.find_iter(statement) {
        let keyword = found.as_str().to_uppercase();
        if !allowed_operations.iter().any(|op| op.eq_ignore_ascii_case(&keyword)) {
            return Err(ToolError::QueryRejected(format!(
                "{keyword} operations are not allowed unless explicitly declared"
            )));
        }
    }

    Ok(())
}
