//! Execution launching and resolution seams
//!
//! [`Launcher`] is the supervisor's bridge to the database and the engine:
//! it creates pending execution rows pinned to the workflow's current
//! version and later starts the engine drive from the pinned snapshot —
//! never from the mutable workflow row. The resolver types back the
//! `database-query`, `llm`, and `integration-operation` nodes with
//! encrypted connection records.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use flowmaestro_core::{ErrorKind, NodeError, WorkflowDefinition};
use flowmaestro_durable::ExecutionParams;
use flowmaestro_nodes::{CredentialResolver, DatabaseConnectionResolver};
use flowmaestro_storage::models::CreateExecution;
use flowmaestro_storage::{Database, EncryptionService};
use flowmaestro_triggers::{ExecutionLauncher, LaunchRequest};

use crate::AppEngine;

pub struct Launcher {
    db: Database,
    engine: Arc<AppEngine>,
}

impl Launcher {
    pub fn new(db: Database, engine: Arc<AppEngine>) -> Self {
        Self { db, engine }
    }

    /// Resolve everything an engine drive needs from the execution row.
    pub async fn params_for(&self, execution_id: Uuid) -> anyhow::Result<ExecutionParams> {
        let execution = self
            .db
            .get_execution_any(execution_id)
            .await?
            .context("execution not found")?;

        let snapshot = self
            .db
            .get_version_by_number(execution.workflow_id, execution.version)
            .await?
            .context("pinned version snapshot missing")?;

        let definition = WorkflowDefinition::from_json(&snapshot.definition)
            .context("pinned snapshot does not parse")?;

        Ok(ExecutionParams {
            execution_id,
            user_id: execution.user_id,
            definition,
            inputs: execution.inputs,
            trigger: execution.trigger_payload,
        })
    }

    /// Restart drives for executions that were in flight when the process
    /// died.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let unfinished = self.engine.unfinished().await?;
        let mut recovered = 0;

        for execution_id in unfinished {
            match self.params_for(execution_id).await {
                Ok(params) => match self.engine.resume(params).await {
                    Ok(()) => recovered += 1,
                    Err(err) => {
                        tracing::warn!(%execution_id, error = %err, "failed to resume execution")
                    }
                },
                Err(err) => {
                    tracing::warn!(%execution_id, error = %err, "cannot rebuild execution params")
                }
            }
        }

        Ok(recovered)
    }
}

#[async_trait]
impl ExecutionLauncher for Launcher {
    async fn create_execution(&self, req: LaunchRequest) -> anyhow::Result<Uuid> {
        let workflow = self
            .db
            .get_workflow(req.workflow_id, req.user_id)
            .await?
            .context("workflow not found")?;

        let row = self
            .db
            .create_execution(CreateExecution {
                workflow_id: workflow.id,
                version: workflow.version,
                user_id: req.user_id,
                inputs: req.inputs,
                trigger_id: req.trigger_id,
                trigger_payload: req.trigger_payload,
            })
            .await?;

        Ok(row.id)
    }

    async fn start_engine(&self, execution_id: Uuid) -> anyhow::Result<()> {
        let params = self.params_for(execution_id).await?;
        self.engine.start(params).await?;
        Ok(())
    }
}

// =============================================================================
// Node resolution seams
// =============================================================================

/// Decrypts integration credentials for `llm` and `integration-operation`
/// nodes.
pub struct StoredCredentialResolver {
    db: Database,
    encryption: Option<Arc<EncryptionService>>,
}

impl StoredCredentialResolver {
    pub fn new(db: Database, encryption: Option<Arc<EncryptionService>>) -> Self {
        Self { db, encryption }
    }
}

#[async_trait]
impl CredentialResolver for StoredCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<Value, NodeError> {
        let id: Uuid = credential_id.parse().map_err(|_| {
            NodeError::validation(format!("credential id {credential_id:?} is not a uuid"))
        })?;

        let Some(encryption) = &self.encryption else {
            return Err(NodeError::permanent(
                ErrorKind::Server,
                "credential storage is not configured",
            ));
        };

        let row = self
            .db
            .get_integration_connection(id)
            .await
            .map_err(|e| NodeError::retryable(ErrorKind::Server, e.to_string()))?
            .ok_or_else(|| {
                NodeError::permanent(
                    ErrorKind::NotFound,
                    format!("unknown credential {credential_id:?}"),
                )
            })?;

        encryption
            .decrypt_json(&row.encrypted_credentials)
            .map_err(|e| NodeError::permanent(ErrorKind::Server, e.to_string()))
    }
}

/// Resolves `database-query` connection ids to DSNs.
pub struct StoredConnectionResolver {
    db: Database,
    encryption: Option<Arc<EncryptionService>>,
}

impl StoredConnectionResolver {
    pub fn new(db: Database, encryption: Option<Arc<EncryptionService>>) -> Self {
        Self { db, encryption }
    }

    fn dsn_from_config(config: &Value) -> anyhow::Result<String> {
        match config.get("dsn").and_then(Value::as_str) {
            Some(dsn) => Ok(dsn.to_string()),
            None => bail!("connection config has no dsn"),
        }
    }
}

#[async_trait]
impl DatabaseConnectionResolver for StoredConnectionResolver {
    async fn resolve_dsn(&self, connection_id: &str) -> Result<String, NodeError> {
        let id: Uuid = connection_id.parse().map_err(|_| {
            NodeError::validation(format!("connection id {connection_id:?} is not a uuid"))
        })?;

        let Some(encryption) = &self.encryption else {
            return Err(NodeError::permanent(
                ErrorKind::Server,
                "connection storage is not configured",
            ));
        };

        let row = self
            .db
            .get_database_connection(id)
            .await
            .map_err(|e| NodeError::retryable(ErrorKind::Server, e.to_string()))?
            .ok_or_else(|| {
                NodeError::permanent(
                    ErrorKind::NotFound,
                    format!("unknown database connection {connection_id:?}"),
                )
            })?;

        let config = encryption
            .decrypt_json(&row.encrypted_config)
            .map_err(|e| NodeError::permanent(ErrorKind::Server, e.to_string()))?;

        Self::dsn_from_config(&config)
            .map_err(|e| NodeError::permanent(ErrorKind::Validation, e.to_string()))
    }
}
