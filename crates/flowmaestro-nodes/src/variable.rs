//! Variable node: get/set/delete in one of three scopes
//!
//! The output records the operation in full so the engine can rebuild
//! variable state from the event history on recovery.

use async_trait::async_trait;
use serde_json::{json, Value};

use flowmaestro_core::{NodeContext, NodeError, NodeExecutor, NodeMetadata, VariableScope};

pub struct VariableExecutor;

fn parse_scope(raw: &str) -> Result<VariableScope, NodeError> {
    match raw {
        "workflow" => Ok(VariableScope::Workflow),
        "global" => Ok(VariableScope::Global),
        "temporary" => Ok(VariableScope::Temporary),
        other => Err(NodeError::validation(format!(
            "unknown variable scope {other:?}"
        ))),
    }
}

#[async_trait]
impl NodeExecutor for VariableExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("state", false).with_config_schema(json!({
            "type": "object",
            "required": ["operation", "name"],
            "properties": {
                "operation": { "enum": ["get", "set", "delete"] },
                "scope": { "enum": ["workflow", "global", "temporary"], "default": "workflow" },
                "name": { "type": "string" },
                "value": {}
            }
        }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let operation = config
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("variable config requires \"operation\""))?;
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("variable config requires \"name\""))?;
        let scope_raw = config
            .get("scope")
            .and_then(Value::as_str)
            .unwrap_or("workflow");
        let scope = parse_scope(scope_raw)?;

        let value = match operation {
            "get" => ctx.get_variable(scope, name).await.unwrap_or(Value::Null),
            "set" => {
                let value = config.get("value").cloned().unwrap_or(Value::Null);
                ctx.set_variable(scope, name, value.clone()).await?;
                value
            }
            "delete" => {
                ctx.delete_variable(scope, name).await?;
                Value::Null
            }
            other => {
                return Err(NodeError::validation(format!(
                    "unknown variable operation {other:?}"
                )))
            }
        };

        Ok(json!({
            "operation": operation,
            "scope": scope_raw,
            "name": name,
            "value": value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCtx;

    #[tokio::test]
    async fn test_set_then_get() {
        let ctx = TestCtx::new();

        let out = VariableExecutor
            .execute(
                json!({"operation": "set", "scope": "workflow", "name": "region", "value": "eu"}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out["value"], "eu");

        let out = VariableExecutor
            .execute(
                json!({"operation": "get", "scope": "workflow", "name": "region"}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out["value"], "eu");
    }

    #[tokio::test]
    async fn test_delete_removes_value() {
        let ctx = TestCtx::new();
        VariableExecutor
            .execute(
                json!({"operation": "set", "scope": "global", "name": "x", "value": 1}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();
        VariableExecutor
            .execute(
                json!({"operation": "delete", "scope": "global", "name": "x"}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();

        let out = VariableExecutor
            .execute(
                json!({"operation": "get", "scope": "global", "name": "x"}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out["value"], Value::Null);
    }

    #[tokio::test]
    async fn test_default_scope_is_workflow() {
        let ctx = TestCtx::new();
        VariableExecutor
            .execute(
                json!({"operation": "set", "name": "k", "value": true}),
                json!({}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(ctx.workflow.read().unwrap()["k"], true);
    }

    #[tokio::test]
    async fn test_invalid_scope_is_rejected() {
        let err = VariableExecutor
            .execute(
                json!({"operation": "get", "scope": "cosmic", "name": "k"}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, flowmaestro_core::ErrorKind::Validation);
    }
}
