//! Connection management: database connections and integration credentials
//!
//! Payloads are encrypted at rest; list and read responses never include
//! the stored blob, only metadata.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::common::{created, ok, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDatabaseConnectionRequest {
    pub name: String,

    /// Connection config, at minimum `{"dsn": "postgres://…"}`.
    #[schema(value_type = Object)]
    pub config: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIntegrationConnectionRequest {
    pub provider: String,
    pub name: String,

    /// Credential payload, e.g. `{"api_key": "…"}`.
    #[schema(value_type = Object)]
    pub credentials: Value,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/connections/database",
            get(list_database_connections).post(create_database_connection),
        )
        .route(
            "/api/connections/database/:id",
            axum::routing::delete(delete_database_connection),
        )
        .route(
            "/api/connections/integration",
            get(list_integration_connections).post(create_integration_connection),
        )
        .route(
            "/api/connections/integration/:id",
            axum::routing::delete(delete_integration_connection),
        )
        .with_state(state)
}

fn require_encryption(state: &AppState) -> Result<&flowmaestro_storage::EncryptionService, ApiError> {
    state
        .encryption
        .as_deref()
        .ok_or_else(|| ApiError::server("credential storage is not configured"))
}

/// POST /api/connections/database
#[utoipa::path(
    post,
    path = "/api/connections/database",
    request_body = CreateDatabaseConnectionRequest,
    responses(
        (status = 201, description = "Connection stored encrypted"),
        (status = 500, description = "Encryption not configured")
    ),
    tag = "connections"
)]
pub async fn create_database_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateDatabaseConnectionRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    if req.config.get("dsn").and_then(Value::as_str).is_none() {
        return Err(ApiError::validation("config requires a \"dsn\" string"));
    }

    let encryption = require_encryption(&state)?;
    let blob = encryption
        .encrypt_json(&req.config)
        .map_err(|e| ApiError::server(e.to_string()))?;

    let row = state
        .db
        .create_database_connection(user.user_id, &req.name, &blob)
        .await?;

    Ok(created(json!({
        "id": row.id,
        "name": row.name,
        "createdAt": row.created_at,
    })))
}

/// GET /api/connections/database
#[utoipa::path(
    get,
    path = "/api/connections/database",
    responses((status = 200, description = "Connection metadata, never secrets")),
    tag = "connections"
)]
pub async fn list_database_connections(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Value>> {
    let rows = state.db.list_database_connections(user.user_id).await?;
    let connections: Vec<Value> = rows
        .iter()
        .map(|r| json!({ "id": r.id, "name": r.name, "createdAt": r.created_at }))
        .collect();
    Ok(ok(connections))
}

/// DELETE /api/connections/database/:id
#[utoipa::path(
    delete,
    path = "/api/connections/database/{id}",
    params(("id" = Uuid, Path, description = "Connection ID")),
    responses(
        (status = 200, description = "Connection removed"),
        (status = 404, description = "Connection not found")
    ),
    tag = "connections"
)]
pub async fn delete_database_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deleted = state.db.delete_database_connection(id, user.user_id).await?;
    if !deleted {
        return Err(ApiError::not_found("connection not found"));
    }
    Ok(ok(json!({ "deleted": true })))
}

/// POST /api/connections/integration
#[utoipa::path(
    post,
    path = "/api/connections/integration",
    request_body = CreateIntegrationConnectionRequest,
    responses(
        (status = 201, description = "Credentials stored encrypted"),
        (status = 500, description = "Encryption not configured")
    ),
    tag = "connections"
)]
pub async fn create_integration_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateIntegrationConnectionRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    let encryption = require_encryption(&state)?;
    let blob = encryption
        .encrypt_json(&req.credentials)
        .map_err(|e| ApiError::server(e.to_string()))?;

    let row = state
        .db
        .create_integration_connection(user.user_id, &req.provider, &req.name, &blob)
        .await?;

    Ok(created(json!({
        "id": row.id,
        "provider": row.provider,
        "name": row.name,
        "createdAt": row.created_at,
    })))
}

/// GET /api/connections/integration
#[utoipa::path(
    get,
    path = "/api/connections/integration",
    responses((status = 200, description = "Connection metadata, never secrets")),
    tag = "connections"
)]
pub async fn list_integration_connections(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Value>> {
    let rows = state.db.list_integration_connections(user.user_id).await?;
    let connections: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "provider": r.provider,
                "name": r.name,
                "createdAt": r.created_at,
            })
        })
        .collect();
    Ok(ok(connections))
}

/// DELETE /api/connections/integration/:id
#[utoipa::path(
    delete,
    path = "/api/connections/integration/{id}",
    params(("id" = Uuid, Path, description = "Connection ID")),
    responses(
        (status = 200, description = "Connection removed"),
        (status = 404, description = "Connection not found")
    ),
    tag = "connections"
)]
pub async fn delete_integration_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .db
        .delete_integration_connection(id, user.user_id)
        .await?;
    if !deleted {
        return Err(ApiError::not_found("connection not found"));
    }
    Ok(ok(json!({ "deleted": true })))
}
