//! Built-in node executors
//!
//! One executor per built-in node type, registered into the core
//! [`ExecutorRegistry`] at process start. `user-input`, `delay`, and `loop`
//! are engine-mediated (suspension and sub-graph semantics) and have no
//! executor here.

pub mod conditional;
pub mod database_query;
pub mod http;
pub mod integration;
pub mod llm;
pub mod resolver;
pub mod transform;
pub mod variable;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use flowmaestro_core::{node_types, ConnectorRegistry, ExecutorRegistry};

pub use resolver::{
    CredentialResolver, DatabaseConnectionResolver, NullCredentialResolver,
    NullDatabaseConnectionResolver,
};

/// External services the built-in executors depend on.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub http_client: reqwest::Client,
    pub connectors: Arc<ConnectorRegistry>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub connections: Arc<dyn DatabaseConnectionResolver>,
}

impl BuiltinDeps {
    /// Dependencies wired to no-op resolvers; enough for workflows that do
    /// not touch connections or integrations.
    pub fn minimal() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            connectors: Arc::new(ConnectorRegistry::new()),
            credentials: Arc::new(NullCredentialResolver),
            connections: Arc::new(NullDatabaseConnectionResolver),
        }
    }
}

/// Register every built-in executor.
pub fn register_builtins(registry: &ExecutorRegistry, deps: BuiltinDeps) {
    registry.register(
        node_types::HTTP,
        Arc::new(http::HttpExecutor::new(deps.http_client.clone())),
    );
    registry.register(node_types::TRANSFORM, Arc::new(transform::TransformExecutor));
    registry.register(
        node_types::CONDITIONAL,
        Arc::new(conditional::ConditionalExecutor),
    );
    registry.register(node_types::VARIABLE, Arc::new(variable::VariableExecutor));
    registry.register(
        node_types::DATABASE_QUERY,
        Arc::new(database_query::DatabaseQueryExecutor::new(
            deps.connections.clone(),
        )),
    );
    registry.register(
        node_types::LLM,
        Arc::new(llm::LlmExecutor::new(
            deps.http_client.clone(),
            deps.credentials.clone(),
        )),
    );
    registry.register(
        node_types::INTEGRATION_OPERATION,
        Arc::new(integration::IntegrationExecutor::new(
            deps.connectors.clone(),
            deps.credentials.clone(),
        )),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtins_registered() {
        let registry = ExecutorRegistry::new();
        register_builtins(&registry, BuiltinDeps::minimal());

        for node_type in [
            node_types::HTTP,
            node_types::TRANSFORM,
            node_types::CONDITIONAL,
            node_types::VARIABLE,
            node_types::DATABASE_QUERY,
            node_types::LLM,
            node_types::INTEGRATION_OPERATION,
        ] {
            assert!(registry.contains(node_type), "missing {node_type}");
        }

        // Engine-mediated types stay out of the registry.
        assert!(!registry.contains(node_types::USER_INPUT));
        assert!(!registry.contains(node_types::DELAY));
        assert!(!registry.contains(node_types::LOOP));
    }
}
