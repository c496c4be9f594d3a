// FlowMaestro API server

mod auth;
mod common;
mod connections;
mod executions;
mod hooks;
mod launcher;
mod triggers;
mod versions;
mod workflows;
mod ws;

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use flowmaestro_core::{Config, ConnectorRegistry, ExecutorRegistry};
use flowmaestro_durable::{
    CompositeObserver, Engine, EngineEvent, EngineObserver, PostgresExecutionEventStore,
};
use flowmaestro_events::{EventBus, FanoutHub};
use flowmaestro_nodes::{register_builtins, BuiltinDeps};
use flowmaestro_storage::{Database, EncryptionService};
use flowmaestro_triggers::{AdmissionConfig, TriggerSupervisor};

use crate::auth::{AuthConfig, AuthUser};
use crate::common::{ok, ApiResult};
use crate::launcher::{Launcher, StoredConnectionResolver, StoredCredentialResolver};

/// The engine as deployed: PostgreSQL-backed event store.
pub type AppEngine = Engine<PostgresExecutionEventStore>;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub engine: Arc<AppEngine>,
    pub supervisor: Arc<TriggerSupervisor>,
    pub hub: FanoutHub,
    pub auth: AuthConfig,
    pub encryption: Option<Arc<EncryptionService>>,
}

/// Observer slot filled after the supervisor exists; breaks the
/// engine → supervisor → launcher → engine construction cycle.
struct LateObserver(OnceLock<Arc<dyn EngineObserver>>);

impl LateObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self(OnceLock::new()))
    }

    fn set(&self, observer: Arc<dyn EngineObserver>) {
        let _ = self.0.set(observer);
    }
}

impl EngineObserver for LateObserver {
    fn publish(&self, event: EngineEvent) {
        if let Some(inner) = self.0.get() {
            inner.publish(event);
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/events/stats — fan-out delivery counters
#[utoipa::path(
    get,
    path = "/api/events/stats",
    responses((status = 200, description = "Subscriber and drop counters")),
    tag = "events"
)]
async fn event_stats(State(state): State<AppState>, _user: AuthUser) -> ApiResult<Json<Value>> {
    Ok(ok(json!({
        "subscribers": state.hub.subscriber_count(),
        "totalDropped": state.hub.total_dropped(),
    })))
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::list_workflows,
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::update_workflow,
        workflows::delete_workflow,
        versions::list_versions,
        versions::create_snapshot,
        versions::get_version,
        versions::delete_version,
        versions::rename_version,
        versions::revert_version,
        executions::list_executions,
        executions::start_execution,
        executions::get_execution,
        executions::cancel_execution,
        executions::submit_input,
        executions::get_logs,
        triggers::list_triggers,
        triggers::create_trigger,
        triggers::get_trigger,
        triggers::update_trigger,
        triggers::delete_trigger,
        triggers::trigger_executions,
        triggers::trigger_webhook_logs,
        connections::create_database_connection,
        connections::list_database_connections,
        connections::delete_database_connection,
        connections::create_integration_connection,
        connections::list_integration_connections,
        connections::delete_integration_connection,
        hooks::webhook_ingress,
        event_stats,
    ),
    components(schemas(
        workflows::CreateWorkflowRequest,
        workflows::UpdateWorkflowRequest,
        versions::CreateSnapshotRequest,
        versions::RenameVersionRequest,
        executions::StartExecutionRequest,
        executions::SubmitInputRequest,
        triggers::CreateTriggerRequest,
        triggers::UpdateTriggerRequest,
        connections::CreateDatabaseConnectionRequest,
        connections::CreateIntegrationConnectionRequest,
    )),
    tags(
        (name = "workflows", description = "Workflow management"),
        (name = "versions", description = "Immutable definition snapshots"),
        (name = "executions", description = "Execution lifecycle and logs"),
        (name = "triggers", description = "Schedule, webhook, event, and manual triggers"),
        (name = "connections", description = "Encrypted connection storage"),
        (name = "hooks", description = "Webhook ingress"),
        (name = "events", description = "Live event fan-out")
    ),
    info(
        title = "FlowMaestro API",
        version = "0.2.0",
        description = "Workflow automation platform: durable executions, triggers, live events",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("flowmaestro={},tower_http=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowmaestro-api starting...");

    let db = Database::from_url(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("connected to database");

    // Encryption is optional: without it, connection storage endpoints
    // refuse writes but everything else works.
    let encryption = match EncryptionService::from_env() {
        Ok(service) => {
            tracing::info!("encryption service initialized");
            Some(Arc::new(service))
        }
        Err(err) => {
            tracing::warn!(error = %err, "encryption not configured; connection storage disabled");
            None
        }
    };

    // Node executors and connectors register once, before anything runs.
    let registry = Arc::new(ExecutorRegistry::new());
    let connectors = Arc::new(ConnectorRegistry::new());
    register_builtins(
        &registry,
        BuiltinDeps {
            http_client: reqwest::Client::new(),
            connectors: connectors.clone(),
            credentials: Arc::new(StoredCredentialResolver::new(
                db.clone(),
                encryption.clone(),
            )),
            connections: Arc::new(StoredConnectionResolver::new(
                db.clone(),
                encryption.clone(),
            )),
        },
    );
    tracing::info!(types = ?registry.registered_types(), "node executors registered");

    let hub = FanoutHub::new();
    let late_observer = LateObserver::new();
    let observer = CompositeObserver::new()
        .push(Arc::new(hub.clone()))
        .push(late_observer.clone());

    let store = PostgresExecutionEventStore::new(db.pool().clone());
    let engine = Arc::new(
        Engine::new(store, registry)
            .with_journal(Arc::new(db.clone()))
            .with_status_sink(Arc::new(db.clone()))
            .with_observer(Arc::new(observer)),
    );

    let launcher = Arc::new(Launcher::new(db.clone(), engine.clone()));
    let supervisor = Arc::new(
        TriggerSupervisor::new(
            db.clone(),
            launcher.clone(),
            EventBus::new(),
            AdmissionConfig::default(),
        )
        .await
        .context("failed to build trigger supervisor")?,
    );
    late_observer.set(supervisor.observer());

    supervisor
        .start()
        .await
        .context("failed to start trigger supervisor")?;

    // Re-drive executions the previous process left in flight.
    match launcher.recover().await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "resumed in-flight executions"),
        Err(err) => tracing::error!(error = %err, "recovery sweep failed"),
    }

    let state = AppState {
        db,
        engine,
        supervisor: supervisor.clone(),
        hub,
        auth: AuthConfig::new(&config.jwt_secret),
        encryption,
    };

    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/api/events/stats",
            get(event_stats).with_state(state.clone()),
        )
        .merge(workflows::routes(state.clone()))
        .merge(versions::routes(state.clone()))
        .merge(executions::routes(state.clone()))
        .merge(triggers::routes(state.clone()))
        .merge(connections::routes(state.clone()))
        .merge(hooks::routes(state.clone()))
        .merge(ws::routes(state.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(supervisor: Arc<TriggerSupervisor>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    supervisor.shutdown().await;
}
