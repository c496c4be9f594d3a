//! Node executor seam and process-wide registry
//!
//! Every node type the engine can dispatch is an implementation of
//! [`NodeExecutor`] registered under its type tag. Executors are pure with
//! respect to engine state: they receive interpolated config and predecessor
//! outputs, classify their own failures, and talk back to the engine only
//! through the [`NodeContext`] handed to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::NodeError;

/// Severity of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime of a user variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Visible only within the owning execution
    Workflow,

    /// Shared across all of the user's executions, last write wins
    Global,

    /// Dropped when the owning node finishes
    Temporary,
}

/// Static description of a node type.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetadata {
    pub category: &'static str,

    /// Whether failures of this type are worth retrying by default.
    pub retryable: bool,

    /// Per-dispatch deadline; the engine classifies expiry as `timeout`.
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    /// JSON schema of the accepted config object.
    pub config_schema: Value,

    /// JSON schema of the produced output.
    pub output_schema: Value,
}

impl NodeMetadata {
    pub fn new(category: &'static str, retryable: bool) -> Self {
        Self {
            category,
            retryable,
            default_timeout: Duration::from_secs(30),
            config_schema: Value::Null,
            output_schema: Value::Null,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }
}

/// Engine services exposed to a running executor.
#[async_trait]
pub trait NodeContext: Send + Sync {
    fn execution_id(&self) -> Uuid;

    fn node_name(&self) -> &str;

    /// Append a structured entry to the execution journal.
    fn log(&self, level: LogLevel, message: &str, payload: Option<Value>);

    async fn get_variable(&self, scope: VariableScope, name: &str) -> Option<Value>;

    async fn set_variable(
        &self,
        scope: VariableScope,
        name: &str,
        value: Value,
    ) -> Result<(), NodeError>;

    async fn delete_variable(&self, scope: VariableScope, name: &str) -> Result<(), NodeError>;

    /// Cooperative cancellation; executors must observe this at every
    /// suspension point.
    fn cancellation(&self) -> CancellationToken;
}

/// A registered node type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn metadata(&self) -> NodeMetadata;

    /// Run one dispatch. `config` has already been interpolated against the
    /// execution scope; `inputs` holds the outputs of satisfied predecessor
    /// nodes keyed by node name.
    async fn execute(
        &self,
        config: Value,
        inputs: Value,
        ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError>;
}

/// Process-wide mapping from node-type tag to executor.
///
/// Registration happens once at startup; lookups afterwards are lock-free
/// reads.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        let node_type = node_type.into();
        tracing::debug!(node_type = %node_type, "registered node executor");
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).map(|e| e.value().clone())
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

mod duration_secs {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl NodeExecutor for EchoExecutor {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new("test", false)
        }

        async fn execute(
            &self,
            config: Value,
            _inputs: Value,
            _ctx: &dyn NodeContext,
        ) -> Result<Value, NodeError> {
            Ok(config)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(EchoExecutor));

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.registered_types(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = NodeMetadata::new("network", true);
        assert_eq!(meta.default_timeout, Duration::from_secs(30));
        assert!(meta.retryable);
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = NodeMetadata::new("network", true)
            .with_timeout(Duration::from_secs(10))
            .with_config_schema(json!({"type": "object"}));

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["default_timeout"], 10);
        assert_eq!(value["config_schema"]["type"], "object");
    }
}
