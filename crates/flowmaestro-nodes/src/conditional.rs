//! Conditional node: evaluate a predicate, emit on one of two handles
//!
//! The config's operands arrive interpolated, so the predicate is a plain
//! comparison of resolved values. The node succeeds either way; which handle
//! it selects decides which outgoing edges survive.

use async_trait::async_trait;
use serde_json::{json, Value};

use flowmaestro_core::{NodeContext, NodeError, NodeExecutor, NodeMetadata};

pub struct ConditionalExecutor;

#[async_trait]
impl NodeExecutor for ConditionalExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("logic", false).with_config_schema(json!({
            "type": "object",
            "required": ["operator"],
            "properties": {
                "left": {},
                "operator": { "type": "string" },
                "right": {}
            }
        }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        // Accept both a flat config and a nested {"predicate": {...}}.
        let predicate = config.get("predicate").unwrap_or(&config);

        let operator = predicate
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("conditional config requires \"operator\""))?;
        let left = predicate.get("left").unwrap_or(&Value::Null);
        let right = predicate.get("right").unwrap_or(&Value::Null);

        let result = evaluate(operator, left, right)?;
        let handle = if result { "true" } else { "false" };

        Ok(json!({ "handle": handle, "value": result }))
    }
}

fn evaluate(operator: &str, left: &Value, right: &Value) -> Result<bool, NodeError> {
    Ok(match operator {
        "equals" => values_equal(left, right),
        "notEquals" => !values_equal(left, right),
        "greaterThan" => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Greater),
        "greaterThanOrEquals" => {
            compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Less)
        }
        "lessThan" => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Less),
        "lessThanOrEquals" => {
            compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Greater)
        }
        "contains" => contains(left, right),
        "exists" => !left.is_null(),
        "truthy" => truthy(left),
        other => {
            return Err(NodeError::validation(format!(
                "unknown conditional operator {other:?}"
            )))
        }
    })
}

/// Numbers compare numerically even across integer/float representations;
/// everything else requires exact equality.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r);
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return Some(l.cmp(r));
    }
    None
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCtx;

    async fn run(config: Value) -> Value {
        ConditionalExecutor
            .execute(config, json!({}), &TestCtx::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_equals_selects_true_handle() {
        let out = run(json!({"left": "api", "operator": "equals", "right": "api"})).await;
        assert_eq!(out["handle"], "true");
        assert_eq!(out["value"], true);
    }

    #[tokio::test]
    async fn test_equals_selects_false_handle() {
        let out = run(json!({"left": "database", "operator": "equals", "right": "api"})).await;
        assert_eq!(out["handle"], "false");
    }

    #[tokio::test]
    async fn test_numeric_comparison_across_representations() {
        let out = run(json!({"left": 2, "operator": "equals", "right": 2.0})).await;
        assert_eq!(out["handle"], "true");

        let out = run(json!({"left": 3, "operator": "greaterThan", "right": 2.5})).await;
        assert_eq!(out["handle"], "true");
    }

    #[tokio::test]
    async fn test_contains_on_arrays_and_strings() {
        let out = run(json!({"left": [1, 2, 3], "operator": "contains", "right": 2})).await;
        assert_eq!(out["handle"], "true");

        let out = run(json!({"left": "hello world", "operator": "contains", "right": "world"}))
            .await;
        assert_eq!(out["handle"], "true");
    }

    #[tokio::test]
    async fn test_truthy_and_exists() {
        let out = run(json!({"left": "", "operator": "truthy"})).await;
        assert_eq!(out["handle"], "false");

        let out = run(json!({"left": null, "operator": "exists"})).await;
        assert_eq!(out["handle"], "false");

        let out = run(json!({"left": 0, "operator": "exists"})).await;
        assert_eq!(out["handle"], "true");
    }

    #[tokio::test]
    async fn test_nested_predicate_wrapper() {
        let out = run(json!({"predicate": {"left": 1, "operator": "lessThan", "right": 5}})).await;
        assert_eq!(out["handle"], "true");
    }

    #[tokio::test]
    async fn test_unknown_operator_is_rejected() {
        let err = ConditionalExecutor
            .execute(
                json!({"left": 1, "operator": "spaceship", "right": 2}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, flowmaestro_core::ErrorKind::Validation);
    }
}
