//! # agent-tools
//!
//! Concrete tools for the task executor.
//!
//! - [`HttpTool`] (`http_request`): calls external HTTP endpoints; loopback,
//!   private and link-local targets are refused
//! - [`DatabaseTool`] (`database`): structured or screened raw SQL against
//!   caller-specified Postgres databases, one pool per connection
//!
//! ```text
//! TaskExecutor ──► ToolRegistry ──┬──► http_request ──► url_guard ──► reqwest
//!                                 └──► database ──► query builder ──► PgDatabase pool
//! ```

pub mod database;
pub mod error;
pub mod http;
pub mod query;
pub mod url_guard;

use std::sync::Arc;

use agent_core::ToolRegistry;

pub use database::{ConnectionConfig, Connector, DatabaseTool, DATABASE_TOOL_NAME};
pub use error::{Result, ToolError};
pub use http::{HttpTool, HttpToolConfig, HTTP_TOOL_NAME};
pub use query::{build_query, build_where_clause, escape_identifier, validate_query, QueryOp, QuerySpec};
pub use url_guard::{is_blocked_url, is_valid_url};

/// Registry with the HTTP and database tools.
///
/// The database tool is returned as well so the caller can close its pools
/// on shutdown.
pub fn default_registry(http: HttpToolConfig) -> Result<(ToolRegistry, Arc<DatabaseTool>)> {
    let database = Arc::new(DatabaseTool::new());

    let mut registry = ToolRegistry::new();
    registry.register(HttpTool::with_config(http)?);
    registry.register_boxed(database.clone());

    Ok((registry, database))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_registry() {
        let (registry, database) = default_registry(HttpToolConfig::default()).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.has(HTTP_TOOL_NAME));
        assert!(registry.has(DATABASE_TOOL_NAME));
        assert_eq!(database.pool_count(), 0);

        let prompt = registry.generate_prompt_section();
        assert!(prompt.contains("### database"));
        assert!(prompt.contains("### http_request"));
    }
}
