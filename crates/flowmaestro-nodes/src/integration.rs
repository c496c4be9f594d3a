//! Integration operation node
//!
//! Invokes a named operation on a registered external provider. The node is
//! a thin shim: locate the connector, decrypt the credential, hand over the
//! interpolated params, and pass the classified result through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowmaestro_core::{
    ConnectorRegistry, ErrorKind, LogLevel, NodeContext, NodeError, NodeExecutor, NodeMetadata,
};

use crate::resolver::CredentialResolver;

pub struct IntegrationExecutor {
    connectors: Arc<ConnectorRegistry>,
    credentials: Arc<dyn CredentialResolver>,
}

impl IntegrationExecutor {
    pub fn new(
        connectors: Arc<ConnectorRegistry>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self {
            connectors,
            credentials,
        }
    }
}

#[async_trait]
impl NodeExecutor for IntegrationExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("integration", true)
            .with_timeout(Duration::from_secs(60))
            .with_config_schema(json!({
                "type": "object",
                "required": ["provider", "operation"],
                "properties": {
                    "provider": { "type": "string" },
                    "operation": { "type": "string" },
                    "params": { "type": "object" },
                    "credentialId": { "type": "string" }
                }
            }))
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let provider = config
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::validation("integration-operation config requires \"provider\"")
            })?;
        let operation = config
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::validation("integration-operation config requires \"operation\"")
            })?;

        let connector = self.connectors.get(provider).ok_or_else(|| {
            NodeError::permanent(
                ErrorKind::NotFound,
                format!("no connector registered for provider {provider:?}"),
            )
        })?;

        // Credentials decrypt here and live only for this invocation.
        let credentials = match config.get("credentialId").and_then(Value::as_str) {
            Some(credential_id) => self.credentials.resolve(credential_id).await?,
            None => Value::Null,
        };

        let params = config.get("params").cloned().unwrap_or(json!({}));

        ctx.log(
            LogLevel::Debug,
            &format!("invoking {provider}:{operation}"),
            None,
        );

        connector.execute(operation, params, credentials).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NullCredentialResolver;
    use crate::testutil::TestCtx;
    use flowmaestro_core::{Connector, ConnectorOperation};

    struct FakeConnector;

    #[async_trait]
    impl Connector for FakeConnector {
        fn provider(&self) -> &str {
            "crm"
        }

        async fn list_operations(&self) -> Vec<ConnectorOperation> {
            vec![ConnectorOperation {
                id: "create_contact".to_string(),
                schema: json!({"type": "object"}),
                retryable: true,
            }]
        }

        async fn execute(
            &self,
            operation_id: &str,
            params: Value,
            credentials: Value,
        ) -> Result<Value, NodeError> {
            assert!(credentials.is_null());
            match operation_id {
                "create_contact" => Ok(json!({"id": "c-1", "email": params["email"]})),
                other => Err(NodeError::permanent(
                    ErrorKind::NotFound,
                    format!("unknown operation {other:?}"),
                )),
            }
        }
    }

    fn executor() -> IntegrationExecutor {
        let connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(FakeConnector));
        IntegrationExecutor::new(Arc::new(connectors), Arc::new(NullCredentialResolver))
    }

    #[tokio::test]
    async fn test_dispatches_to_connector() {
        let out = executor()
            .execute(
                json!({
                    "provider": "crm",
                    "operation": "create_contact",
                    "params": {"email": "a@example.com"}
                }),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["email"], "a@example.com");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_not_found() {
        let err = executor()
            .execute(
                json!({"provider": "ghost", "operation": "x"}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_connector_errors_pass_through_classified() {
        let err = executor()
            .execute(
                json!({"provider": "crm", "operation": "missing_op"}),
                json!({}),
                &TestCtx::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.retryable);
    }
}
