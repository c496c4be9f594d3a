//! Resolution seams for credentials and database connections
//!
//! Executors reference credentials and connections by opaque id; the API
//! layer wires these traits to the storage crate, which owns the encrypted
//! blobs. Decrypted material only exists for the duration of one call.

use async_trait::async_trait;
use serde_json::Value;

use flowmaestro_core::{ErrorKind, NodeError};

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Decrypt and return the credential payload for `credential_id`.
    async fn resolve(&self, credential_id: &str) -> Result<Value, NodeError>;
}

#[async_trait]
pub trait DatabaseConnectionResolver: Send + Sync {
    /// Return the connection string for a stored database connection.
    async fn resolve_dsn(&self, connection_id: &str) -> Result<String, NodeError>;
}

/// Resolver that knows nothing; every lookup is `not_found`.
pub struct NullCredentialResolver;

#[async_trait]
impl CredentialResolver for NullCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<Value, NodeError> {
        Err(NodeError::permanent(
            ErrorKind::NotFound,
            format!("unknown credential {credential_id:?}"),
        ))
    }
}

pub struct NullDatabaseConnectionResolver;

#[async_trait]
impl DatabaseConnectionResolver for NullDatabaseConnectionResolver {
    async fn resolve_dsn(&self, connection_id: &str) -> Result<String, NodeError> {
        Err(NodeError::permanent(
            ErrorKind::NotFound,
            format!("unknown database connection {connection_id:?}"),
        ))
    }
}
