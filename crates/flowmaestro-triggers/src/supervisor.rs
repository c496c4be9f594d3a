//! Trigger supervisor
//!
//! Owns the lifecycle of all four trigger kinds: schedule jobs in a
//! hot-reloadable cron scheduler (add/remove without restarting anything),
//! webhook ingress handling, event-topic watchers, and the manual start
//! path. Every launch goes through per-user admission control: non-webhook
//! starts queue FIFO when the user is over the running ceiling, webhooks
//! fail fast so the queue cannot grow without bound.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowmaestro_durable::{EngineEvent, EngineObserver, RunningCounts};
use flowmaestro_events::EventBus;
use flowmaestro_storage::models::{CreateWebhookLog, TriggerRow};
use flowmaestro_storage::Database;

use crate::types::{EventConfig, ScheduleConfig, TriggerKind, WebhookConfig, WebhookResponseFormat};
use crate::webhook;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid trigger config: {0}")]
    InvalidConfig(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Creates execution records and starts engine drives; implemented by the
/// API layer, which owns both the database and the engine.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    /// Create a pending execution pinned to the workflow's current version.
    async fn create_execution(&self, req: LaunchRequest) -> anyhow::Result<Uuid>;

    /// Begin driving a previously created execution.
    async fn start_engine(&self, execution_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub inputs: Value,
    pub trigger_id: Option<Uuid>,
    pub trigger_payload: Option<Value>,
}

/// Per-user admission ceiling.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_running_per_user: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_running_per_user: 25,
        }
    }
}

/// What happened to a start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,

    /// Over the ceiling; parked in the FIFO start queue.
    Queued,

    /// Over the ceiling on a webhook path; the caller answers 503.
    Rejected,
}

/// The inbound request as the webhook route saw it. Header names are
/// expected lowercase.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: Map<String, Value>,
    pub query: Map<String, Value>,
    pub body: Vec<u8>,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub status: u16,
    pub body: String,
    pub json: bool,
}

pub struct TriggerSupervisor {
    db: Database,
    launcher: Arc<dyn ExecutionLauncher>,
    bus: EventBus,
    admission: AdmissionConfig,
    running: Arc<RunningCounts>,
    start_queue: Mutex<VecDeque<(Uuid, Uuid)>>,
    scheduler: RwLock<JobScheduler>,
    jobs: DashMap<Uuid, Uuid>,
    event_watchers: DashMap<Uuid, tokio::task::JoinHandle<()>>,
}

impl TriggerSupervisor {
    pub async fn new(
        db: Database,
        launcher: Arc<dyn ExecutionLauncher>,
        bus: EventBus,
        admission: AdmissionConfig,
    ) -> Result<Self, TriggerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;

        Ok(Self {
            db,
            launcher,
            bus,
            admission,
            running: Arc::new(RunningCounts::new()),
            start_queue: Mutex::new(VecDeque::new()),
            scheduler: RwLock::new(scheduler),
            jobs: DashMap::new(),
            event_watchers: DashMap::new(),
        })
    }

    /// Register every enabled schedule from the database and start ticking.
    /// Fire times missed while the process was down are skipped; the next
    /// valid tick is the first to fire.
    pub async fn start(self: &Arc<Self>) -> Result<(), TriggerError> {
        let schedules = self
            .db
            .list_enabled_schedules()
            .await
            .map_err(TriggerError::Other)?;
        let count = schedules.len();

        for trigger in &schedules {
            if let Err(err) = self.register_schedule(trigger).await {
                error!(trigger_id = %trigger.id, error = %err, "failed to register schedule");
            }
        }

        self.scheduler
            .read()
            .await
            .start()
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;

        info!(schedules = count, "trigger supervisor started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        for entry in self.event_watchers.iter() {
            entry.value().abort();
        }
        self.event_watchers.clear();

        let mut scheduler = self.scheduler.write().await;
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
        info!("trigger supervisor stopped");
    }

    /// The observer the engine publishes through: terminal events release
    /// admission slots and drain the start queue.
    pub fn observer(self: &Arc<Self>) -> Arc<dyn EngineObserver> {
        Arc::new(SupervisorObserver(Arc::downgrade(self)))
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Bring the runtime state for one trigger in line with its row: add or
    /// remove schedule jobs and event watchers after create/update/delete.
    pub async fn sync_trigger(self: &Arc<Self>, trigger: &TriggerRow) -> Result<(), TriggerError> {
        let kind: TriggerKind = trigger
            .kind
            .parse()
            .map_err(TriggerError::InvalidConfig)?;
        let active = trigger.enabled && trigger.deleted_at.is_none();

        match kind {
            TriggerKind::Schedule => {
                if active {
                    self.register_schedule(trigger).await?;
                } else {
                    self.remove_schedule(trigger.id).await;
                }
            }
            TriggerKind::Event => {
                if active {
                    self.watch_event_trigger(trigger)?;
                } else {
                    self.unwatch_event_trigger(trigger.id);
                }
            }
            // Webhooks are pull-based: ingress re-reads the row each time,
            // so disabling is effective immediately. Manual has no runtime
            // state at all.
            TriggerKind::Webhook | TriggerKind::Manual => {}
        }

        Ok(())
    }

    // =========================================================================
    // Manual starts
    // =========================================================================

    /// The `POST /api/executions` path.
    pub async fn start_manual(
        self: &Arc<Self>,
        workflow_id: Uuid,
        user_id: Uuid,
        inputs: Value,
    ) -> anyhow::Result<(Uuid, StartOutcome)> {
        let execution_id = self
            .launcher
            .create_execution(LaunchRequest {
                workflow_id,
                user_id,
                inputs,
                trigger_id: None,
                trigger_payload: None,
            })
            .await?;

        let outcome = self.try_start(user_id, execution_id, false).await?;
        Ok((execution_id, outcome))
    }

    async fn try_start(
        self: &Arc<Self>,
        user_id: Uuid,
        execution_id: Uuid,
        is_webhook: bool,
    ) -> anyhow::Result<StartOutcome> {
        if self.running.get(user_id) >= self.admission.max_running_per_user {
            if is_webhook {
                return Ok(StartOutcome::Rejected);
            }
            self.start_queue.lock().push_back((user_id, execution_id));
            debug!(%execution_id, %user_id, "start queued: user over admission ceiling");
            return Ok(StartOutcome::Queued);
        }

        self.running.increment(user_id);
        if let Err(err) = self.launcher.start_engine(execution_id).await {
            self.running.decrement(user_id);
            return Err(err);
        }
        Ok(StartOutcome::Started)
    }

    /// Pop queued starts whose user fits under the ceiling again. FIFO: a
    /// head entry that still does not fit blocks the queue.
    fn drain_queue(self: &Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.start_queue.lock();
                match queue.front() {
                    Some((user_id, _))
                        if self.running.get(*user_id)
                            < self.admission.max_running_per_user =>
                    {
                        queue.pop_front()
                    }
                    _ => None,
                }
            };

            let Some((user_id, execution_id)) = next else {
                break;
            };

            self.running.increment(user_id);
            let supervisor = self.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor.launcher.start_engine(execution_id).await {
                    supervisor.running.decrement(user_id);
                    error!(%execution_id, error = %err, "queued start failed");
                }
            });
        }
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn register_schedule(self: &Arc<Self>, trigger: &TriggerRow) -> Result<(), TriggerError> {
        let config: ScheduleConfig = serde_json::from_value(trigger.config.clone())
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        let cron_expr = normalize_cron(&config.cron)?;
        let tz: Tz = config.timezone.parse().unwrap_or(chrono_tz::UTC);

        // Replace any existing job for this trigger before adding the new
        // one; updates reuse this path.
        self.remove_schedule(trigger.id).await;

        let supervisor = Arc::downgrade(self);
        let trigger_id = trigger.id;
        let workflow_id = trigger.workflow_id;
        let user_id = trigger.user_id;
        let fire_cron = cron_expr.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let supervisor = supervisor.clone();
            let fire_cron = fire_cron.clone();
            Box::pin(async move {
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                supervisor
                    .fire_schedule(trigger_id, workflow_id, user_id, &fire_cron, tz)
                    .await;
            })
        })
        .map_err(|e| TriggerError::Scheduler(e.to_string()))?;

        let job_id = self
            .scheduler
            .write()
            .await
            .add(job)
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;
        self.jobs.insert(trigger.id, job_id);

        let next = next_fire(&cron_expr, tz);
        self.db
            .set_schedule_handle(trigger.id, Some(&job_id.to_string()), next)
            .await
            .map_err(TriggerError::Other)?;

        debug!(trigger_id = %trigger.id, cron = %config.cron, "schedule registered");
        Ok(())
    }

    async fn remove_schedule(&self, trigger_id: Uuid) {
        if let Some((_, job_id)) = self.jobs.remove(&trigger_id) {
            if let Err(err) = self.scheduler.read().await.remove(&job_id).await {
                warn!(%trigger_id, error = %err, "failed to remove schedule job");
            }
        }
        if let Err(err) = self.db.set_schedule_handle(trigger_id, None, None).await {
            warn!(%trigger_id, error = %err, "failed to clear schedule handle");
        }
    }

    async fn fire_schedule(
        self: &Arc<Self>,
        trigger_id: Uuid,
        workflow_id: Uuid,
        user_id: Uuid,
        cron_expr: &str,
        tz: Tz,
    ) {
        // The row is re-read at fire time so a disable or delete that raced
        // with the tick is honored.
        match self.db.get_trigger(trigger_id, user_id).await {
            Ok(Some(trigger)) if trigger.enabled => {}
            _ => {
                debug!(%trigger_id, "skipping fire for disabled or deleted trigger");
                return;
            }
        }

        let fired_at = Utc::now();
        let launch = self
            .launcher
            .create_execution(LaunchRequest {
                workflow_id,
                user_id,
                inputs: json!({ "firedAt": fired_at.to_rfc3339() }),
                trigger_id: Some(trigger_id),
                trigger_payload: None,
            })
            .await;

        let execution_id = match launch {
            Ok(id) => id,
            Err(err) => {
                error!(%trigger_id, error = %err, "schedule fire failed to create execution");
                return;
            }
        };

        if let Err(err) = self
            .db
            .record_trigger_fire(trigger_id, execution_id, next_fire(cron_expr, tz))
            .await
        {
            error!(%trigger_id, error = %err, "failed to record trigger fire");
        }

        match self.try_start(user_id, execution_id, false).await {
            Ok(outcome) => {
                info!(%trigger_id, %execution_id, ?outcome, "schedule fired");
            }
            Err(err) => {
                error!(%trigger_id, %execution_id, error = %err, "schedule fire failed to start engine");
            }
        }
    }

    // =========================================================================
    // Event triggers
    // =========================================================================

    fn watch_event_trigger(self: &Arc<Self>, trigger: &TriggerRow) -> Result<(), TriggerError> {
        let config: EventConfig = serde_json::from_value(trigger.config.clone())
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;

        let mut receiver = self.bus.subscribe(&config.topic);
        let supervisor = Arc::downgrade(self);
        let trigger_id = trigger.id;
        let workflow_id = trigger.workflow_id;
        let user_id = trigger.user_id;

        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if !config.matches(&event.payload) {
                    continue;
                }
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor
                    .fire_event_trigger(trigger_id, workflow_id, user_id, event.payload)
                    .await;
            }
        });

        if let Some(previous) = self.event_watchers.insert(trigger.id, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn unwatch_event_trigger(&self, trigger_id: Uuid) {
        if let Some((_, handle)) = self.event_watchers.remove(&trigger_id) {
            handle.abort();
        }
    }

    async fn fire_event_trigger(
        self: &Arc<Self>,
        trigger_id: Uuid,
        workflow_id: Uuid,
        user_id: Uuid,
        payload: Value,
    ) {
        let launch = self
            .launcher
            .create_execution(LaunchRequest {
                workflow_id,
                user_id,
                inputs: payload.clone(),
                trigger_id: Some(trigger_id),
                trigger_payload: Some(payload),
            })
            .await;

        let execution_id = match launch {
            Ok(id) => id,
            Err(err) => {
                error!(%trigger_id, error = %err, "event fire failed to create execution");
                return;
            }
        };

        if let Err(err) = self.db.record_trigger_fire(trigger_id, execution_id, None).await {
            error!(%trigger_id, error = %err, "failed to record trigger fire");
        }
        if let Err(err) = self.try_start(user_id, execution_id, false).await {
            error!(%trigger_id, %execution_id, error = %err, "event fire failed to start engine");
        }
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Handle one inbound webhook request. Exactly one webhook log row is
    /// written no matter which path the request takes.
    pub async fn handle_webhook(
        self: &Arc<Self>,
        workflow_id: Uuid,
        trigger_id: Uuid,
        request: WebhookRequest,
    ) -> WebhookReply {
        let started = Instant::now();

        let trigger = match self.db.get_trigger_for_webhook(workflow_id, trigger_id).await {
            Ok(trigger) => trigger,
            Err(err) => {
                error!(%trigger_id, error = %err, "webhook trigger lookup failed");
                return self
                    .finish_webhook(
                        workflow_id,
                        trigger_id,
                        &request,
                        started,
                        500,
                        err_body("server", "trigger lookup failed"),
                        None,
                        Some(err.to_string()),
                    )
                    .await;
            }
        };

        let Some(trigger) = trigger.filter(|t| t.enabled && t.kind == "webhook") else {
            return self
                .finish_webhook(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    404,
                    err_body("not_found", "webhook not found"),
                    None,
                    Some("trigger missing, disabled, or not a webhook".to_string()),
                )
                .await;
        };

        let config: WebhookConfig =
            serde_json::from_value(trigger.config.clone()).unwrap_or_default();

        if !config.method_allowed(&request.method) {
            return self
                .finish_webhook(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    405,
                    err_body("validation", "method not allowed"),
                    None,
                    Some(format!("method {} not allowed", request.method)),
                )
                .await;
        }

        if config.verify_signature {
            let presented = request
                .headers
                .get(&config.signature_header.to_lowercase())
                .and_then(Value::as_str)
                .unwrap_or_default();
            let valid = trigger
                .secret
                .as_deref()
                .is_some_and(|secret| webhook::verify(secret, &request.body, presented));
            if !valid {
                return self
                    .finish_webhook(
                        workflow_id,
                        trigger_id,
                        &request,
                        started,
                        401,
                        err_body("auth", "invalid signature"),
                        None,
                        Some("signature verification failed".to_string()),
                    )
                    .await;
            }
        }

        // Fail fast over the ceiling; webhooks never queue.
        if self.running.get(trigger.user_id) >= self.admission.max_running_per_user {
            return self
                .finish_webhook(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    503,
                    err_body("rate_limited", "too many running executions"),
                    None,
                    Some("admission ceiling exceeded".to_string()),
                )
                .await;
        }

        let body_value: Value = serde_json::from_slice(&request.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&request.body).to_string()));
        let inputs = json!({
            "method": request.method,
            "headers": request.headers,
            "body": body_value,
            "query": request.query,
        });

        let launch = self
            .launcher
            .create_execution(LaunchRequest {
                workflow_id,
                user_id: trigger.user_id,
                inputs: inputs.clone(),
                trigger_id: Some(trigger_id),
                trigger_payload: Some(inputs),
            })
            .await;

        let execution_id = match launch {
            Ok(id) => id,
            Err(err) => {
                return self
                    .finish_webhook(
                        workflow_id,
                        trigger_id,
                        &request,
                        started,
                        500,
                        err_body("server", "failed to create execution"),
                        None,
                        Some(err.to_string()),
                    )
                    .await;
            }
        };

        if let Err(err) = self.db.record_trigger_fire(trigger_id, execution_id, None).await {
            error!(%trigger_id, error = %err, "failed to record trigger fire");
        }

        match self.try_start(trigger.user_id, execution_id, true).await {
            Ok(StartOutcome::Started) => {
                let (body, is_json) = match config.response_format {
                    WebhookResponseFormat::Json => (
                        json!({ "success": true, "executionId": execution_id }).to_string(),
                        true,
                    ),
                    WebhookResponseFormat::Text => ("ok".to_string(), false),
                };
                self.finish_webhook_with(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    200,
                    body,
                    is_json,
                    Some(execution_id),
                    None,
                )
                .await
            }
            Ok(_) => {
                self.finish_webhook(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    503,
                    err_body("rate_limited", "too many running executions"),
                    Some(execution_id),
                    Some("admission ceiling exceeded".to_string()),
                )
                .await
            }
            Err(err) => {
                self.finish_webhook(
                    workflow_id,
                    trigger_id,
                    &request,
                    started,
                    500,
                    err_body("server", "failed to start execution"),
                    Some(execution_id),
                    Some(err.to_string()),
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_webhook(
        &self,
        workflow_id: Uuid,
        trigger_id: Uuid,
        request: &WebhookRequest,
        started: Instant,
        status: u16,
        body: String,
        execution_id: Option<Uuid>,
        error: Option<String>,
    ) -> WebhookReply {
        self.finish_webhook_with(
            workflow_id,
            trigger_id,
            request,
            started,
            status,
            body,
            true,
            execution_id,
            error,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_webhook_with(
        &self,
        workflow_id: Uuid,
        trigger_id: Uuid,
        request: &WebhookRequest,
        started: Instant,
        status: u16,
        body: String,
        is_json: bool,
        execution_id: Option<Uuid>,
        error: Option<String>,
    ) -> WebhookReply {
        let log = CreateWebhookLog {
            workflow_id: Some(workflow_id),
            trigger_id: Some(trigger_id),
            method: request.method.clone(),
            path: request.path.clone(),
            headers: Value::Object(request.headers.clone()),
            query: Value::Object(request.query.clone()),
            body: Some(String::from_utf8_lossy(&request.body).to_string()),
            response_status: status as i32,
            response_body: Some(body.clone()),
            execution_id,
            source_ip: request.source_ip.clone(),
            duration_ms: started.elapsed().as_millis() as i64,
            error,
        };

        if let Err(err) = self.db.create_webhook_log(log).await {
            error!(%trigger_id, error = %err, "failed to persist webhook log");
        }

        WebhookReply {
            status,
            body,
            json: is_json,
        }
    }
}

struct SupervisorObserver(Weak<TriggerSupervisor>);

impl EngineObserver for SupervisorObserver {
    fn publish(&self, event: EngineEvent) {
        if matches!(
            event.name.as_str(),
            "execution.completed" | "execution.failed" | "execution.cancelled"
        ) {
            if let Some(supervisor) = self.0.upgrade() {
                supervisor.running.decrement(event.user_id);
                supervisor.drain_queue();
            }
        }
    }
}

fn err_body(code: &str, message: &str) -> String {
    json!({ "success": false, "error": { "code": code, "message": message } }).to_string()
}

/// Accept the standard five-field cron form by prepending a seconds field;
/// the scheduler wants six or seven fields.
pub fn normalize_cron(expr: &str) -> Result<String, TriggerError> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        _ => {
            return Err(TriggerError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5-7 fields, got {fields}"),
            })
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| TriggerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(normalized)
}

/// Next fire time for a normalized expression, in UTC.
pub fn next_fire(normalized: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(normalized).ok()?;
    schedule
        .upcoming(tz)
        .next()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_five_field_cron() {
        let normalized = normalize_cron("*/5 * * * *").unwrap();
        assert_eq!(normalized, "0 */5 * * * *");
    }

    #[test]
    fn test_normalize_keeps_six_fields() {
        let normalized = normalize_cron("0 30 9 * * Mon").unwrap();
        assert_eq!(normalized, "0 30 9 * * Mon");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_cron("not a cron").is_err());
        assert!(normalize_cron("* *").is_err());
        assert!(normalize_cron("99 99 99 99 99").is_err());
    }

    #[test]
    fn test_next_fire_is_in_the_future() {
        let normalized = normalize_cron("*/5 * * * *").unwrap();
        let next = next_fire(&normalized, chrono_tz::UTC).unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        // Daily at 09:00 local; the two zones must produce different UTC
        // instants (except during the few hours they coincide, which these
        // zones never do).
        let normalized = normalize_cron("0 9 * * *").unwrap();
        let tokyo = next_fire(&normalized, chrono_tz::Asia::Tokyo).unwrap();
        let new_york = next_fire(&normalized, chrono_tz::America::New_York).unwrap();
        assert_ne!(tokyo, new_york);
    }
}
