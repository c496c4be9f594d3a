//! Trigger management routes

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowmaestro_storage::models::{CreateTrigger, TriggerRow, UpdateTrigger};
use flowmaestro_triggers::{normalize_cron, webhook, EventConfig, ScheduleConfig, TriggerKind, WebhookConfig};

use crate::auth::AuthUser;
use crate::common::{created, ok, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTriggerRequest {
    #[serde(rename = "workflowId")]
    pub workflow_id: Uuid,
    pub name: String,
    pub kind: String,

    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: Value,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTriggerRequest {
    pub name: Option<String>,

    #[schema(value_type = Object)]
    pub config: Option<Value>,

    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListTriggersParams {
    #[serde(rename = "workflowId")]
    pub workflow_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/api/triggers/:id",
            get(get_trigger).put(update_trigger).delete(delete_trigger),
        )
        .route("/api/triggers/:id/executions", get(trigger_executions))
        .route("/api/triggers/:id/webhook-logs", get(trigger_webhook_logs))
        .with_state(state)
}

fn trigger_json(row: &TriggerRow) -> Value {
    json!({
        "id": row.id,
        "workflowId": row.workflow_id,
        "name": row.name,
        "kind": row.kind,
        "config": row.config,
        "enabled": row.enabled,
        "triggerCount": row.trigger_count,
        "lastFiredAt": row.last_fired_at,
        "nextFireAt": row.next_fire_at,
        "scheduleHandle": row.schedule_handle,
        "secret": row.secret,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    })
}

/// Validate the kind-specific config shape before anything is persisted.
fn validate_config(kind: TriggerKind, config: &Value) -> Result<(), ApiError> {
    match kind {
        TriggerKind::Schedule => {
            let parsed: ScheduleConfig = serde_json::from_value(config.clone())
                .map_err(|e| ApiError::validation(format!("schedule config: {e}")))?;
            normalize_cron(&parsed.cron).map_err(|e| ApiError::validation(e.to_string()))?;
            parsed
                .timezone
                .parse::<chrono_tz::Tz>()
                .map_err(|_| ApiError::validation(format!("unknown timezone {:?}", parsed.timezone)))?;
        }
        TriggerKind::Webhook => {
            serde_json::from_value::<WebhookConfig>(config.clone())
                .map_err(|e| ApiError::validation(format!("webhook config: {e}")))?;
        }
        TriggerKind::Event => {
            let parsed: EventConfig = serde_json::from_value(config.clone())
                .map_err(|e| ApiError::validation(format!("event config: {e}")))?;
            if parsed.topic.trim().is_empty() {
                return Err(ApiError::validation("event config requires a topic"));
            }
        }
        TriggerKind::Manual => {}
    }
    Ok(())
}

/// GET /api/triggers
#[utoipa::path(
    get,
    path = "/api/triggers",
    params(("workflowId" = Option<Uuid>, Query, description = "Filter by workflow")),
    responses((status = 200, description = "The caller's triggers")),
    tag = "triggers"
)]
pub async fn list_triggers(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListTriggersParams>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .db
        .list_triggers(user.user_id, params.workflow_id)
        .await?;
    Ok(ok(rows.iter().map(trigger_json).collect::<Vec<_>>()))
}

/// POST /api/triggers
#[utoipa::path(
    post,
    path = "/api/triggers",
    request_body = CreateTriggerRequest,
    responses(
        (status = 201, description = "Trigger created"),
        (status = 400, description = "Invalid kind or config"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "triggers"
)]
pub async fn create_trigger(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateTriggerRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Value>)> {
    let kind: TriggerKind = req
        .kind
        .parse()
        .map_err(|e: String| ApiError::validation(e))?;
    validate_config(kind, &req.config)?;

    state
        .db
        .get_workflow(req.workflow_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("workflow not found"))?;

    // Webhook triggers always carry a signing secret from birth.
    let secret = matches!(kind, TriggerKind::Webhook).then(webhook::generate_secret);

    let row = state
        .db
        .create_trigger(CreateTrigger {
            workflow_id: req.workflow_id,
            user_id: user.user_id,
            name: req.name,
            kind: kind.as_str().to_string(),
            config: req.config,
            enabled: req.enabled,
            secret,
        })
        .await?;

    state
        .supervisor
        .sync_trigger(&row)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;

    tracing::info!(trigger_id = %row.id, kind = %row.kind, "trigger created");
    Ok(created(trigger_json(&row)))
}

/// GET /api/triggers/:id
#[utoipa::path(
    get,
    path = "/api/triggers/{id}",
    params(("id" = Uuid, Path, description = "Trigger ID")),
    responses(
        (status = 200, description = "Trigger found"),
        (status = 404, description = "Trigger not found")
    ),
    tag = "triggers"
)]
pub async fn get_trigger(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = state
        .db
        .get_trigger(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("trigger not found"))?;
    Ok(ok(trigger_json(&row)))
}

/// PUT /api/triggers/:id
#[utoipa::path(
    put,
    path = "/api/triggers/{id}",
    params(("id" = Uuid, Path, description = "Trigger ID")),
    request_body = UpdateTriggerRequest,
    responses(
        (status = 200, description = "Trigger updated"),
        (status = 404, description = "Trigger not found")
    ),
    tag = "triggers"
)]
pub async fn update_trigger(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTriggerRequest>,
) -> ApiResult<Json<Value>> {
    let existing = state
        .db
        .get_trigger(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("trigger not found"))?;

    if let Some(config) = &req.config {
        let kind: TriggerKind = existing
            .kind
            .parse()
            .map_err(|e: String| ApiError::server(e))?;
        validate_config(kind, config)?;
    }

    let row = state
        .db
        .update_trigger(
            id,
            user.user_id,
            UpdateTrigger {
                name: req.name,
                config: req.config,
                enabled: req.enabled,
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found("trigger not found"))?;

    // Schedule jobs and event watchers follow the row atomically with the
    // persistence change.
    state
        .supervisor
        .sync_trigger(&row)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;

    Ok(ok(trigger_json(&row)))
}

/// DELETE /api/triggers/:id
#[utoipa::path(
    delete,
    path = "/api/triggers/{id}",
    params(("id" = Uuid, Path, description = "Trigger ID")),
    responses(
        (status = 200, description = "Trigger soft-deleted"),
        (status = 404, description = "Trigger not found")
    ),
    tag = "triggers"
)]
pub async fn delete_trigger(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let mut row = state
        .db
        .get_trigger(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("trigger not found"))?;

    let deleted = state.db.soft_delete_trigger(id, user.user_id).await?;
    if !deleted {
        return Err(ApiError::not_found("trigger not found"));
    }

    // Stop the schedule handle / event watcher in the same request.
    row.enabled = false;
    row.deleted_at = Some(chrono::Utc::now());
    state
        .supervisor
        .sync_trigger(&row)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;

    Ok(ok(json!({ "deleted": true })))
}

/// GET /api/triggers/:id/executions
#[utoipa::path(
    get,
    path = "/api/triggers/{id}/executions",
    params(("id" = Uuid, Path, description = "Trigger ID")),
    responses((status = 200, description = "Fire history, newest first")),
    tag = "triggers"
)]
pub async fn trigger_executions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    state
        .db
        .get_trigger(id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("trigger not found"))?;

    let rows = state.db.list_trigger_executions(id, params.limit).await?;
    let history: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "executionId": r.execution_id,
                "firedAt": r.fired_at,
            })
        })
        .collect();
    Ok(ok(history))
}

/// GET /api/triggers/:id/webhook-logs
#[utoipa::path(
    get,
    path = "/api/triggers/{id}/webhook-logs",
    params(("id" = Uuid, Path, description = "Trigger ID")),
    responses((status = 200, description = "Inbound request diagnostics")),
    tag = "triggers"
)]
pub async fn trigger_webhook_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .db
        .list_webhook_logs(id, user.user_id, params.limit)
        .await?;

    let logs: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "method": r.method,
                "path": r.path,
                "responseStatus": r.response_status,
                "executionId": r.execution_id,
                "sourceIp": r.source_ip,
                "durationMs": r.duration_ms,
                "error": r.error,
                "createdAt": r.created_at,
            })
        })
        .collect();
    Ok(ok(logs))
}
