//! Shared test context for executor tests

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flowmaestro_core::{LogLevel, NodeContext, NodeError, VariableScope};

/// A context backed by plain in-memory maps, one per variable scope.
pub struct TestCtx {
    pub workflow: RwLock<Map<String, Value>>,
    pub global: RwLock<Map<String, Value>>,
    pub temp: RwLock<Map<String, Value>>,
    pub cancel: CancellationToken,
}

impl TestCtx {
    pub fn new() -> Self {
        Self {
            workflow: RwLock::new(Map::new()),
            global: RwLock::new(Map::new()),
            temp: RwLock::new(Map::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn map(&self, scope: VariableScope) -> &RwLock<Map<String, Value>> {
        match scope {
            VariableScope::Workflow => &self.workflow,
            VariableScope::Global => &self.global,
            VariableScope::Temporary => &self.temp,
        }
    }
}

#[async_trait]
impl NodeContext for TestCtx {
    fn execution_id(&self) -> Uuid {
        Uuid::nil()
    }

    fn node_name(&self) -> &str {
        "test-node"
    }

    fn log(&self, _level: LogLevel, _message: &str, _payload: Option<Value>) {}

    async fn get_variable(&self, scope: VariableScope, name: &str) -> Option<Value> {
        self.map(scope).read().unwrap().get(name).cloned()
    }

    async fn set_variable(
        &self,
        scope: VariableScope,
        name: &str,
        value: Value,
    ) -> Result<(), NodeError> {
        self.map(scope)
            .write()
            .unwrap()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_variable(&self, scope: VariableScope, name: &str) -> Result<(), NodeError> {
        self.map(scope).write().unwrap().remove(name);
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
