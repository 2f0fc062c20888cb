//! Postgres Persistence
//!
//! `Database` implementation over a sqlx connection pool. Parameters arrive
//! as JSON values and are bound by their JSON type; result columns are
//! decoded by Postgres type name into JSON so the core can normalize rows
//! without knowing the driver.

use std::time::Duration;

use agent_core::db::{Database, QueryResult, Row};
use agent_core::error::{AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgPool, PgPoolOptions, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};

fn db_err(err: sqlx::Error) -> AgentError {
    AgentError::Database(err.to_string())
}

/// Pool settings
#[derive(Clone, Debug, Deserialize)]
pub struct PgConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

impl PgConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
    }
}

/// Postgres-backed `Database`
#[derive(Clone, Debug)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect and verify one connection
    pub async fn connect(config: &PgConfig) -> Result<Self> {
        let pool = config.pool_options().connect(&config.url).await.map_err(db_err)?;
        tracing::info!(max_connections = config.max_connections, "Postgres pool ready");
        Ok(Self { pool })
    }

    /// Build the pool without connecting; connections open on first use
    pub fn connect_lazy(config: &PgConfig) -> Result<Self> {
        let pool = config.pool_options().connect_lazy(&config.url).map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Whether the statement produces a result set
fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT")
        || upper.starts_with("WITH")
        || upper.starts_with("SHOW")
        || upper.starts_with("VALUES")
        || upper.contains(" RETURNING")
}

/// NULL sent with an unspecified parameter type, so Postgres infers it from
/// the statement instead of forcing `text`
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_param<'q>(query: Query<'q, Postgres, PgArguments>, value: &'q Value) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(sqlx::types::Json(other)),
    }
}

fn column_value(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = {
        let raw = row.try_get_raw(idx).map_err(db_err)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match type_name.as_str() {
        "BOOL" => json!(row.try_get::<bool, _>(idx).map_err(db_err)?),
        "INT2" => json!(row.try_get::<i16, _>(idx).map_err(db_err)?),
        "INT4" => json!(row.try_get::<i32, _>(idx).map_err(db_err)?),
        "INT8" => json!(row.try_get::<i64, _>(idx).map_err(db_err)?),
        "FLOAT4" => json!(row.try_get::<f32, _>(idx).map_err(db_err)?),
        "FLOAT8" => json!(row.try_get::<f64, _>(idx).map_err(db_err)?),
        "NUMERIC" => {
            let decimal: Decimal = row.try_get(idx).map_err(db_err)?;
            decimal.to_f64().map_or_else(|| json!(decimal.to_string()), |f| json!(f))
        }
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx).map_err(db_err)?,
        "UUID" => json!(row.try_get::<uuid::Uuid, _>(idx).map_err(db_err)?.to_string()),
        "TIMESTAMPTZ" => json!(row.try_get::<DateTime<Utc>, _>(idx).map_err(db_err)?.to_rfc3339()),
        "TIMESTAMP" => json!(row
            .try_get::<NaiveDateTime, _>(idx)
            .map_err(db_err)?
            .and_utc()
            .to_rfc3339()),
        "DATE" => json!(row.try_get::<NaiveDate, _>(idx).map_err(db_err)?.to_string()),
        _ => match row.try_get::<String, _>(idx) {
            Ok(s) => Value::String(s),
            Err(err) => {
                tracing::debug!(column = idx, type_name = %type_name, error = %err, "Undecodable column");
                Value::Null
            }
        },
    };
    Ok(value)
}

fn row_to_json(row: &PgRow) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_value(row, idx)?);
    }
    Ok(out)
}

#[async_trait]
impl Database for PgDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }

        if returns_rows(sql) {
            let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
            Ok(QueryResult::from_rows(rows))
        } else {
            let done = query.execute(&self.pool).await.map_err(db_err)?;
            Ok(QueryResult {
                rows: Vec::new(),
                row_count: done.rows_affected(),
            })
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
