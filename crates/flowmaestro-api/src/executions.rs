//! Execution routes: start, describe, cancel, signal, logs

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowmaestro_core::WorkflowDefinition;
use flowmaestro_durable::ExecutionSignal;
use flowmaestro_storage::models::{ExecutionFilter, ExecutionRow, LogFilter};
use flowmaestro_triggers::StartOutcome;

use crate::auth::AuthUser;
use crate::common::{created, ok, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartExecutionRequest {
    #[serde(rename = "workflowId")]
    pub workflow_id: Uuid,

    #[serde(default)]
    #[schema(value_type = Object)]
    pub inputs: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitInputRequest {
    /// Waiting node to deliver to; optional when exactly one node waits.
    pub node: Option<String>,

    #[schema(value_type = Object)]
    pub value: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListExecutionsParams {
    pub status: Option<String>,
    #[serde(rename = "workflowId")]
    pub workflow_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogsParams {
    #[serde(rename = "minSeq")]
    pub min_seq: Option<i64>,
    pub level: Option<String>,
    pub node: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/executions", get(list_executions).post(start_execution))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/:id/cancel", post(cancel_execution))
        .route("/api/executions/:id/submit-input", post(submit_input))
        .route("/api/executions/:id/logs", get(get_logs))
        .with_state(state)
}

fn execution_json(row: &ExecutionRow) -> Value {
    json!({
        "id": row.id,
        "workflowId": row.workflow_id,
        "version": row.version,
        "status": row.status,
        "inputs": row.inputs,
        "outputs": row.outputs,
        "error": row.error,
        "failedNode": row.failed_node,
        "triggerId": row.trigger_id,
        "createdAt": row.created_at,
        "startedAt": row.started_at,
        "completedAt": row.completed_at,
    })
}

/// GET /api/executions
#[utoipa::path(
    get,
    path = "/api/executions",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("workflowId" = Option<Uuid>, Query, description = "Filter by workflow"),
        ("limit" = Option<i64>, Query, description = "Page size (default 50)"),
        ("offset" = Option<i64>, Query, description = "Page offset")
    ),
    responses((status = 200, description = "Executions, newest first")),
    tag = "executions"
)]
pub async fn list_executions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListExecutionsParams>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .db
        .list_executions(
            user.user_id,
            ExecutionFilter {
                status: params.status,
                workflow_id: params.workflow_id,
                limit: params.limit,
                offset: params.offset,
            },
        )
        .await?;
    Ok(ok(rows.iter().map(execution_json).collect::<Vec<_>>()))
}

/// POST /api/executions
#[utoipa::path(
    post,
    path = "/api/executions",
    request_body = StartExecutionRequest,
    responses(
        (status = 201, description = "Execution created; started or queued"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "executions"
)]
pub async fn start_execution(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<StartExecutionRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    let (execution_id, outcome) = state
        .supervisor
        .start_manual(req.workflow_id, user.user_id, req.inputs)
        .await
        .map_err(|e| {
            if e.to_string().contains("not found") {
                ApiError::not_found("workflow not found")
            } else {
                ApiError::server(e.to_string())
            }
        })?;

    let row = state
        .db
        .get_execution(execution_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::server("execution vanished after creation"))?;

    let mut body = execution_json(&row);
    body["queued"] = json!(outcome == StartOutcome::Queued);
    Ok(created(body))
}

/// GET /api/executions/:id
#[utoipa::path(
    get,
    path = "/api/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Execution detail with live snapshot"),
        (status = 404, description = "Execution not found")
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_execution(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("execution not found"))?;

    let mut body = execution_json(&row);

    // Non-terminal executions carry a live snapshot from the event history:
    // ready nodes, waiting nodes, partial outputs.
    if !matches!(row.status.as_str(), "completed" | "failed" | "cancelled") {
        if let Ok(Some(snapshot)) = state
            .db
            .get_version_by_number(row.workflow_id, row.version)
            .await
        {
            if let Ok(definition) = WorkflowDefinition::from_json(&snapshot.definition) {
                if let Ok(live) = state.engine.describe(id, definition).await {
                    body["live"] = serde_json::to_value(&live).unwrap_or(Value::Null);
                }
            }
        }
    }

    Ok(ok(body))
}

/// POST /api/executions/:id/cancel
#[utoipa::path(
    post,
    path = "/api/executions/{id}/cancel",
    params(("id" = Uuid, Path, description = "Execution ID")),
    responses(
        (status = 200, description = "Cancellation signal delivered"),
        (status = 404, description = "Execution not found"),
        (status = 409, description = "Execution already terminal")
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_execution(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("execution not found"))?;

    if matches!(row.status.as_str(), "completed" | "failed" | "cancelled") {
        return Err(ApiError::conflict("execution already reached a terminal state"));
    }

    let signal_id = state
        .engine
        .signal(id, ExecutionSignal::cancel("cancelled via API"))
        .await?;

    tracing::info!(execution_id = %id, "cancellation requested");
    Ok(ok(json!({ "signalId": signal_id })))
}

/// POST /api/executions/:id/submit-input
#[utoipa::path(
    post,
    path = "/api/executions/{id}/submit-input",
    params(("id" = Uuid, Path, description = "Execution ID")),
    request_body = SubmitInputRequest,
    responses(
        (status = 200, description = "Input signal delivered"),
        (status = 400, description = "No node waiting, or ambiguous target"),
        (status = 404, description = "Execution not found")
    ),
    tag = "executions"
)]
pub async fn submit_input(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitInputRequest>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_execution(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("execution not found"))?;

    let node = match req.node {
        Some(node) => node,
        None => {
            // Resolve the single waiting node from the live snapshot.
            let snapshot = state
                .db
                .get_version_by_number(row.workflow_id, row.version)
                .await?
                .ok_or_else(|| ApiError::server("pinned snapshot missing"))?;
            let definition = WorkflowDefinition::from_json(&snapshot.definition)
                .map_err(|e| ApiError::server(e.to_string()))?;
            let live = state.engine.describe(id, definition).await?;

            match live.waiting_on.as_slice() {
                [single] => single.clone(),
                [] => return Err(ApiError::validation("no node is waiting for input")),
                several => {
                    return Err(ApiError::validation(format!(
                        "several nodes are waiting ({}); specify \"node\"",
                        several.join(", ")
                    )))
                }
            }
        }
    };

    let signal_id = state
        .engine
        .signal(id, ExecutionSignal::user_input(node, req.value))
        .await?;

    Ok(ok(json!({ "signalId": signal_id })))
}

/// GET /api/executions/:id/logs
#[utoipa::path(
    get,
    path = "/api/executions/{id}/logs",
    params(
        ("id" = Uuid, Path, description = "Execution ID"),
        ("minSeq" = Option<i64>, Query, description = "Return entries after this sequence"),
        ("level" = Option<String>, Query, description = "Filter by severity"),
        ("node" = Option<String>, Query, description = "Filter by node name"),
        ("limit" = Option<i64>, Query, description = "Page size (default 50)")
    ),
    responses((status = 200, description = "Log entries in sequence order")),
    tag = "executions"
)]
pub async fn get_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<LogsParams>,
) -> ApiResult<Json<Value>> {
    // Ownership check before reading the log stream.
    state
        .db
        .get_execution(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("execution not found"))?;

    let rows = state
        .db
        .list_logs(
            id,
            LogFilter {
                min_seq: params.min_seq,
                level: params.level,
                node: params.node,
                limit: params.limit,
            },
        )
        .await?;

    let logs: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "seq": row.seq,
                "node": row.node.as_deref().unwrap_or("_engine"),
                "level": row.level,
                "message": row.message,
                "payload": row.payload,
                "createdAt": row.created_at,
            })
        })
        .collect();

    Ok(ok(logs))
}
