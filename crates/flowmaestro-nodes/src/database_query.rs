//! Database query node
//!
//! Executes SQL against a referenced database connection. The connection is
//! stored by id; the resolver hands back a DSN only for the duration of the
//! call. Rows decode to JSON by probing common Postgres column types.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use std::sync::Arc;

use flowmaestro_core::{ErrorKind, NodeContext, NodeError, NodeExecutor, NodeMetadata};

use crate::resolver::DatabaseConnectionResolver;

pub struct DatabaseQueryExecutor {
    connections: Arc<dyn DatabaseConnectionResolver>,
}

impl DatabaseQueryExecutor {
    pub fn new(connections: Arc<dyn DatabaseConnectionResolver>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl NodeExecutor for DatabaseQueryExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("data", true)
            .with_timeout(Duration::from_secs(30))
            .with_config_schema(json!({
                "type": "object",
                "required": ["connectionId", "query"],
                "properties": {
                    "connectionId": { "type": "string" },
                    "query": { "type": "string" }
                }
            }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let connection_id = config
            .get("connectionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::validation("database-query config requires \"connectionId\"")
            })?;
        let query = config
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("database-query config requires \"query\""))?;

        let dsn = self.connections.resolve_dsn(connection_id).await?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&dsn)
            .await
            .map_err(|e| NodeError::retryable(ErrorKind::Network, e.to_string()))?;

        let rows = sqlx::query(query)
            .fetch_all(&pool)
            .await
            .map_err(classify_sqlx)?;

        let decoded: Vec<Value> = rows.iter().map(row_to_json).collect();

        Ok(json!({
            "rows": decoded,
            "rowCount": decoded.len(),
        }))
    }
}

fn classify_sqlx(err: sqlx::Error) -> NodeError {
    match &err {
        sqlx::Error::Database(db) => {
            // Syntax and constraint problems will not fix themselves.
            NodeError::permanent(ErrorKind::Validation, db.to_string())
        }
        sqlx::Error::PoolTimedOut => NodeError::timeout(err.to_string()),
        sqlx::Error::Io(_) => NodeError::retryable(ErrorKind::Network, err.to_string()),
        _ => NodeError::retryable(ErrorKind::Server, err.to_string()),
    }
}

/// Best-effort decode of one row: probe the usual types column by column,
/// fall back to null for anything exotic.
fn row_to_json(row: &PgRow) -> Value {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
            v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
                .unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(i) {
            v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
            v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Value>, _>(i) {
            v.unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        out.insert(column.name().to_string(), value);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NullDatabaseConnectionResolver;
    use crate::testutil::TestCtx;

    #[tokio::test]
    async fn test_missing_connection_id_is_validation() {
        let executor = DatabaseQueryExecutor::new(Arc::new(NullDatabaseConnectionResolver));
        let err = executor
            .execute(json!({"query": "SELECT 1"}), json!({}), &TestCtx::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let executor = DatabaseQueryExecutor::new(Arc::new(NullDatabaseConnectionResolver));
        let err = executor
            .execute(
                json!({"connectionId": "missing", "query": "SELECT 1"}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
