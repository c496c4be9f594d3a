//! Webhook ingress: `/hooks/:workflow_id/:trigger_id`, any method
//!
//! Unauthenticated by design — the HMAC signature is the authentication.
//! All policy (method allow-list, signature check, admission, logging)
//! lives in the supervisor; this route only adapts HTTP.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use flowmaestro_triggers::WebhookRequest;

use crate::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/hooks/:workflow_id/:trigger_id", any(webhook_ingress))
        .with_state(state)
}

/// ANY /hooks/:workflow_id/:trigger_id
#[utoipa::path(
    post,
    path = "/hooks/{workflow_id}/{trigger_id}",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID"),
        ("trigger_id" = Uuid, Path, description = "Trigger ID")
    ),
    request_body = Vec<u8>,
    responses(
        (status = 200, description = "Execution started"),
        (status = 401, description = "Signature verification failed"),
        (status = 404, description = "Unknown or disabled trigger"),
        (status = 405, description = "Method not allowed for this trigger"),
        (status = 503, description = "Admission ceiling exceeded")
    ),
    tag = "hooks"
)]
pub async fn webhook_ingress(
    State(state): State<AppState>,
    Path((workflow_id, trigger_id)): Path<(Uuid, Uuid)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut header_map = Map::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_lowercase(), Value::String(value.to_string()));
        }
    }

    let query_map: Map<String, Value> = query
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());

    let reply = state
        .supervisor
        .handle_webhook(
            workflow_id,
            trigger_id,
            WebhookRequest {
                method: method.to_string(),
                path: format!("/hooks/{workflow_id}/{trigger_id}"),
                headers: header_map,
                query: query_map,
                body: body.to_vec(),
                source_ip,
            },
        )
        .await;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let content_type = if reply.json {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };

    (status, [(header::CONTENT_TYPE, content_type)], reply.body).into_response()
}
