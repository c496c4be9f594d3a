//! Workflow CRUD routes

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowmaestro_core::WorkflowDefinition;
use flowmaestro_storage::models::{CreateWorkflow, UpdateWorkflow, WorkflowRow};

use crate::auth::AuthUser;
use crate::common::{created, ok, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowRequest {
    pub name: String,

    /// Workflow definition in the wire format.
    #[schema(value_type = Object)]
    pub definition: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,

    #[schema(value_type = Object)]
    pub definition: Option<Value>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/:id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .with_state(state)
}

/// Validate a definition against the wire format and graph rules, returning
/// the exact bytes to persist.
fn validate_definition(raw: &Value) -> Result<String, ApiError> {
    let definition: WorkflowDefinition = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::validation(format!("malformed definition: {e}")))?;
    definition
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    serde_json::to_string(raw).map_err(|e| ApiError::server(e.to_string()))
}

fn workflow_json(row: &WorkflowRow) -> Value {
    let definition: Value = serde_json::from_str(&row.definition).unwrap_or(Value::Null);
    json!({
        "id": row.id,
        "name": row.name,
        "definition": definition,
        "version": row.version,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    })
}

/// GET /api/workflows
#[utoipa::path(
    get,
    path = "/api/workflows",
    responses(
        (status = 200, description = "List the caller's workflows"),
        (status = 401, description = "Missing or invalid token")
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Value>> {
    let rows = state.db.list_workflows(user.user_id).await?;
    Ok(ok(rows.iter().map(workflow_json).collect::<Vec<_>>()))
}

/// POST /api/workflows
#[utoipa::path(
    post,
    path = "/api/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created"),
        (status = 400, description = "Definition failed validation")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("workflow name must not be empty"));
    }
    let definition = validate_definition(&req.definition)?;

    let row = state
        .db
        .create_workflow(CreateWorkflow {
            user_id: user.user_id,
            name: req.name,
            definition,
        })
        .await?;

    tracing::info!(workflow_id = %row.id, "workflow created");
    Ok(created(workflow_json(&row)))
}

/// GET /api/workflows/:id
#[utoipa::path(
    get,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow found"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_workflow(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("workflow not found"))?;
    Ok(ok(workflow_json(&row)))
}

/// PUT /api/workflows/:id
#[utoipa::path(
    put,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = UpdateWorkflowRequest,
    responses(
        (status = 200, description = "Workflow updated"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> ApiResult<Json<Value>> {
    let definition = req
        .definition
        .as_ref()
        .map(validate_definition)
        .transpose()?;

    let row = state
        .db
        .update_workflow(
            id,
            user.user_id,
            UpdateWorkflow {
                name: req.name,
                definition,
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found("workflow not found"))?;

    Ok(ok(workflow_json(&row)))
}

/// DELETE /api/workflows/:id
#[utoipa::path(
    delete,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow soft-deleted"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    // Soft delete only; in-flight executions keep running to their terminal
    // state against their pinned snapshots.
    let deleted = state.db.soft_delete_workflow(id, user.user_id).await?;
    if !deleted {
        return Err(ApiError::not_found("workflow not found"));
    }
    Ok(ok(json!({ "deleted": true })))
}
