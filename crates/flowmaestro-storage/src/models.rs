//! Row structs and write inputs for the flowmaestro schema

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Users
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub email: String,
    pub name: String,
    pub is_admin: bool,
}

// ============================================
// Workflows & versions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub definition: String,
    pub version: i32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub user_id: Uuid,
    pub name: String,
    /// Serialized definition exactly as received; stored byte-for-byte.
    pub definition: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflow {
    pub name: Option<String>,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct VersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub label: Option<String>,
    pub definition: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Executions & logs
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub user_id: Uuid,
    pub status: String,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub failed_node: Option<String>,
    pub trigger_id: Option<Uuid>,
    pub trigger_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub workflow_id: Uuid,
    pub version: i32,
    pub user_id: Uuid,
    pub inputs: Value,
    pub trigger_id: Option<Uuid>,
    pub trigger_payload: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionLogRow {
    pub seq: i64,
    pub execution_id: Uuid,
    pub node: Option<String>,
    pub level: String,
    pub message: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub min_seq: Option<i64>,
    pub level: Option<String>,
    pub node: Option<String>,
    pub limit: i64,
}

// ============================================
// Triggers
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct TriggerRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: String,
    pub config: Value,
    pub enabled: bool,
    pub trigger_count: i64,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub schedule_handle: Option<String>,
    pub secret: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTrigger {
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: String,
    pub config: Value,
    pub enabled: bool,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTrigger {
    pub name: Option<String>,
    pub config: Option<Value>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TriggerExecutionRow {
    pub id: i64,
    pub trigger_id: Uuid,
    pub execution_id: Uuid,
    pub fired_at: DateTime<Utc>,
}

// ============================================
// Webhook logs
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WebhookLogRow {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub trigger_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub headers: Value,
    pub query: Value,
    pub body: Option<String>,
    pub response_status: i32,
    pub response_body: Option<String>,
    pub execution_id: Option<Uuid>,
    pub source_ip: Option<String>,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWebhookLog {
    pub workflow_id: Option<Uuid>,
    pub trigger_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub headers: Value,
    pub query: Value,
    pub body: Option<String>,
    pub response_status: i32,
    pub response_body: Option<String>,
    pub execution_id: Option<Uuid>,
    pub source_ip: Option<String>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

// ============================================
// Connections
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct DatabaseConnectionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub encrypted_config: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct IntegrationConnectionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub name: String,
    pub encrypted_credentials: String,
    pub created_at: DateTime<Utc>,
}
