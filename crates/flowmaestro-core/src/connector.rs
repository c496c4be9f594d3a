//! Connector seam for third-party integrations
//!
//! The core never links provider SDKs. Each provider ships a [`Connector`]
//! that can enumerate its operations and execute one with decrypted
//! credentials; the `integration-operation` node type resolves connectors
//! through the [`ConnectorRegistry`]. Credentials live in the core only as
//! opaque ids — decryption happens immediately before `execute` and the
//! plaintext never outlives the call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeError;

/// One operation a provider exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorOperation {
    pub id: String,

    /// JSON schema of the operation's parameters.
    pub schema: Value,

    /// Whether failures of this operation are safe to retry.
    pub retryable: bool,
}

/// A third-party provider client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable provider identifier (`"slack"`, `"hubspot"`, …).
    fn provider(&self) -> &str;

    async fn list_operations(&self) -> Vec<ConnectorOperation>;

    /// Execute one operation. Errors must be classified through
    /// [`NodeError`] so the engine can apply retry policy uniformly.
    async fn execute(
        &self,
        operation_id: &str,
        params: Value,
        credentials: Value,
    ) -> Result<Value, NodeError>;
}

/// Process-wide provider table, populated at startup.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connector: Arc<dyn Connector>) {
        let provider = connector.provider().to_string();
        tracing::debug!(provider = %provider, "registered connector");
        self.connectors.insert(provider, connector);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(provider).map(|c| c.value().clone())
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> =
            self.connectors.iter().map(|c| c.key().clone()).collect();
        providers.sort();
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    struct FakeConnector;

    #[async_trait]
    impl Connector for FakeConnector {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn list_operations(&self) -> Vec<ConnectorOperation> {
            vec![ConnectorOperation {
                id: "send_message".to_string(),
                schema: json!({"type": "object"}),
                retryable: true,
            }]
        }

        async fn execute(
            &self,
            operation_id: &str,
            params: Value,
            _credentials: Value,
        ) -> Result<Value, NodeError> {
            match operation_id {
                "send_message" => Ok(json!({"sent": params["text"]})),
                other => Err(NodeError::permanent(
                    ErrorKind::NotFound,
                    format!("unknown operation {other:?}"),
                )),
            }
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeConnector));

        let connector = registry.get("fake").expect("registered");
        let ops = connector.list_operations().await;
        assert_eq!(ops.len(), 1);

        let result = connector
            .execute("send_message", json!({"text": "hi"}), json!({}))
            .await
            .unwrap();
        assert_eq!(result["sent"], "hi");

        let err = connector
            .execute("missing", json!({}), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_providers_sorted() {
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeConnector));
        assert_eq!(registry.providers(), vec!["fake".to_string()]);
    }
}
