//! Transform node: shape data with an interpolated expression tree
//!
//! The engine interpolates the node's config before dispatch, so by the time
//! this executor runs the expression tree already holds resolved values. The
//! output is the tree itself — the node exists to give a name to a reshaped
//! value downstream nodes can reference.

use async_trait::async_trait;
use serde_json::Value;

use flowmaestro_core::{NodeContext, NodeError, NodeExecutor, NodeMetadata};

pub struct TransformExecutor;

#[async_trait]
impl NodeExecutor for TransformExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("data", false)
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        // An explicit "expression" key wins; otherwise the whole config is
        // the expression tree.
        Ok(match config {
            Value::Object(ref map) if map.contains_key("expression") => {
                map["expression"].clone()
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCtx;
    use serde_json::json;

    #[tokio::test]
    async fn test_bare_config_is_the_output() {
        let out = TransformExecutor
            .execute(json!({"fullName": "Leanne Graham"}), json!({}), &TestCtx::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"fullName": "Leanne Graham"}));
    }

    #[tokio::test]
    async fn test_expression_key_wins() {
        let out = TransformExecutor
            .execute(
                json!({"expression": [1, 2, 3], "timeoutSeconds": 5}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_scalar_config() {
        let out = TransformExecutor
            .execute(json!("hello"), json!({}), &TestCtx::new())
            .await
            .unwrap();
        assert_eq!(out, json!("hello"));
    }
}
