//! Version snapshot routes
//!
//! Snapshots are immutable: labels may be renamed, bytes may not. Reverting
//! copies a historical snapshot's bytes over the current definition and
//! bumps the version counter; executions pinned to other versions are
//! untouched.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowmaestro_storage::models::VersionRow;

use crate::auth::AuthUser;
use crate::common::{created, ok, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSnapshotRequest {
    pub label: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RenameVersionRequest {
    pub label: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/workflows/:id/versions",
            get(list_versions).post(create_snapshot),
        )
        .route(
            "/api/workflows/versions/:id",
            get(get_version).delete(delete_version),
        )
        .route("/api/workflows/versions/rename/:id", post(rename_version))
        .route("/api/workflows/versions/revert/:id", post(revert_version))
        .with_state(state)
}

fn version_json(row: &VersionRow, include_definition: bool) -> Value {
    let mut body = json!({
        "id": row.id,
        "workflowId": row.workflow_id,
        "version": row.version,
        "label": row.label,
        "createdBy": row.created_by,
        "createdAt": row.created_at,
    });
    if include_definition {
        body["definition"] =
            serde_json::from_str(&row.definition).unwrap_or(Value::Null);
    }
    body
}

/// GET /api/workflows/:id/versions
#[utoipa::path(
    get,
    path = "/api/workflows/{id}/versions",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses((status = 200, description = "Version list, newest first")),
    tag = "versions"
)]
pub async fn list_versions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let rows = state.db.list_versions(id, user.user_id).await?;
    Ok(ok(rows
        .iter()
        .map(|r| version_json(r, false))
        .collect::<Vec<_>>()))
}

/// POST /api/workflows/:id/versions
#[utoipa::path(
    post,
    path = "/api/workflows/{id}/versions",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = CreateSnapshotRequest,
    responses(
        (status = 201, description = "Snapshot created"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "versions"
)]
pub async fn create_snapshot(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateSnapshotRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    let row = state
        .db
        .create_snapshot(id, user.user_id, req.label)
        .await?
        .ok_or_else(|| ApiError::not_found("workflow not found"))?;
    Ok(created(version_json(&row, true)))
}

/// GET /api/workflows/versions/:id
#[utoipa::path(
    get,
    path = "/api/workflows/versions/{id}",
    params(("id" = Uuid, Path, description = "Version ID")),
    responses(
        (status = 200, description = "Snapshot with definition"),
        (status = 404, description = "Snapshot not found")
    ),
    tag = "versions"
)]
pub async fn get_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_version(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("version not found"))?;
    Ok(ok(version_json(&row, true)))
}

/// DELETE /api/workflows/versions/:id
#[utoipa::path(
    delete,
    path = "/api/workflows/versions/{id}",
    params(("id" = Uuid, Path, description = "Version ID")),
    responses(
        (status = 200, description = "Snapshot deleted"),
        (status = 404, description = "Snapshot not found")
    ),
    tag = "versions"
)]
pub async fn delete_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .db
        .delete_version(id, user.user_id)
        .await
        .map_err(|e| ApiError::conflict(e.to_string()))?;
    if !deleted {
        return Err(ApiError::not_found("version not found"));
    }
    Ok(ok(json!({ "deleted": true })))
}

/// POST /api/workflows/versions/rename/:id
#[utoipa::path(
    post,
    path = "/api/workflows/versions/rename/{id}",
    params(("id" = Uuid, Path, description = "Version ID")),
    request_body = RenameVersionRequest,
    responses(
        (status = 200, description = "Label updated"),
        (status = 404, description = "Snapshot not found")
    ),
    tag = "versions"
)]
pub async fn rename_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameVersionRequest>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .rename_version(id, user.user_id, req.label)
        .await?
        .ok_or_else(|| ApiError::not_found("version not found"))?;
    Ok(ok(version_json(&row, false)))
}

/// POST /api/workflows/versions/revert/:id
#[utoipa::path(
    post,
    path = "/api/workflows/versions/revert/{id}",
    params(("id" = Uuid, Path, description = "Version ID")),
    responses(
        (status = 200, description = "Current definition reverted"),
        (status = 404, description = "Snapshot not found")
    ),
    tag = "versions"
)]
pub async fn revert_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .revert_to_version(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("version not found"))?;

    tracing::info!(workflow_id = %row.id, version = row.version, "workflow reverted");
    Ok(ok(json!({
        "id": row.id,
        "version": row.version,
        "definition": serde_json::from_str::<Value>(&row.definition).unwrap_or(Value::Null),
    })))
}
