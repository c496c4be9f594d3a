//! End-to-end engine scenarios against the in-memory event store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use flowmaestro_core::{
    node_types, EdgeDefinition, ErrorKind, ErrorStrategy, ExecutorRegistry, NodeContext,
    NodeDefinition, NodeError, NodeMetadata, NodeExecutor, OnErrorPolicy, Position,
    WorkflowDefinition, WorkflowSettings,
};
use flowmaestro_durable::{
    Engine, EngineConfig, EngineEvent, EngineObserver, ExecutionEventStore, ExecutionParams,
    ExecutionSignal, ExecutionStatus, InMemoryExecutionEventStore, RetryPolicy,
};

// =============================================================================
// Mock executors
// =============================================================================

/// Returns a fixed value, ignoring config.
struct StaticExecutor(Value);

#[async_trait]
impl NodeExecutor for StaticExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("test", true)
    }

    async fn execute(
        &self,
        _config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        Ok(self.0.clone())
    }
}

/// Returns its interpolated config verbatim.
struct EchoExecutor;

#[async_trait]
impl NodeExecutor for EchoExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("test", false)
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        Ok(config)
    }
}

/// Emits on the handle named in config, like a real conditional.
struct BranchExecutor;

#[async_trait]
impl NodeExecutor for BranchExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("test", false)
    }

    async fn execute(
        &self,
        config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        let handle = config
            .get("handle")
            .and_then(Value::as_str)
            .unwrap_or("false");
        Ok(json!({ "handle": handle, "value": handle == "true" }))
    }
}

/// Fails with a retryable `server` error N times, then succeeds.
struct FlakyExecutor {
    remaining_failures: AtomicU32,
    output: Value,
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("test", true)
    }

    async fn execute(
        &self,
        _config: Value,
        _inputs: Value,
        _ctx: &dyn NodeContext,
    ) -> Result<Value, NodeError> {
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(NodeError::retryable(ErrorKind::Server, "upstream 500"))
        } else {
            Ok(self.output.clone())
        }
    }
}

/// Collects fan-out events for assertions.
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<EngineEvent>>,
}

impl EngineObserver for RecordingObserver {
    fn publish(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingObserver {
    fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.name.clone()).collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn node(name: &str, node_type: &str, config: Value) -> NodeDefinition {
    NodeDefinition {
        node_type: node_type.to_string(),
        name: name.to_string(),
        config,
        position: Position::default(),
        on_error: None,
    }
}

fn edge(id: &str, source: &str, target: &str) -> EdgeDefinition {
    EdgeDefinition {
        id: id.to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
    }
}

fn definition(
    nodes: Vec<NodeDefinition>,
    edges: Vec<EdgeDefinition>,
    entry: &str,
) -> WorkflowDefinition {
    WorkflowDefinition {
        name: "test".to_string(),
        nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        edges,
        entry_point: entry.to_string(),
        settings: None,
    }
}

fn fast_retry_config() -> EngineConfig {
    EngineConfig {
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        },
        default_node_timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

type TestEngine = Engine<Arc<InMemoryExecutionEventStore>>;

fn engine_with(
    store: Arc<InMemoryExecutionEventStore>,
    registry: Arc<ExecutorRegistry>,
    observer: Arc<RecordingObserver>,
) -> Arc<TestEngine> {
    Arc::new(
        Engine::new(store, registry)
            .with_config(fast_retry_config())
            .with_observer(observer),
    )
}

async fn wait_for_status(
    engine: &Arc<TestEngine>,
    execution_id: Uuid,
    definition: &WorkflowDefinition,
    expected: ExecutionStatus,
) -> flowmaestro_durable::ExecutionSnapshot {
    for _ in 0..250 {
        if let Ok(snapshot) = engine.describe(execution_id, definition.clone()).await {
            if snapshot.status == expected {
                return snapshot;
            }
            assert!(
                !(snapshot.status.is_terminal() && snapshot.status != expected),
                "execution settled in {:?} while waiting for {:?} ({:?})",
                snapshot.status,
                expected,
                snapshot.error,
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for status {expected:?}");
}

fn params(definition: &WorkflowDefinition, inputs: Value) -> ExecutionParams {
    ExecutionParams {
        execution_id: Uuid::now_v7(),
        user_id: Uuid::now_v7(),
        definition: definition.clone(),
        inputs,
        trigger: None,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn linear_happy_path() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(
        "http",
        Arc::new(StaticExecutor(json!({"data": {"name": "Leanne Graham"}}))),
    );
    registry.register("transform", Arc::new(EchoExecutor));

    let def = definition(
        vec![
            node("n1", "http", json!({"url": "https://example.com/users/1", "method": "GET"})),
            node("n2", "transform", json!({"fullName": "${n1.data.name}"})),
        ],
        vec![edge("e1", "n1", "n2")],
        "n1",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    assert_eq!(snapshot.outputs["n2"]["fullName"], "Leanne Graham");
}

#[tokio::test]
async fn conditional_branching_runs_exactly_one_side() {
    for (selected, executed, skipped) in [("true", "api", "db"), ("false", "db", "api")] {
        let registry = Arc::new(ExecutorRegistry::new());
        registry.register("conditional", Arc::new(BranchExecutor));
        registry.register("http", Arc::new(StaticExecutor(json!({"via": "api"}))));
        registry.register(
            "database-query",
            Arc::new(StaticExecutor(json!({"via": "db"}))),
        );

        let def = definition(
            vec![
                node("c1", node_types::CONDITIONAL, json!({"handle": selected})),
                node("api", "http", json!({})),
                node("db", "database-query", json!({})),
            ],
            vec![
                EdgeDefinition {
                    source_handle: Some("true".to_string()),
                    ..edge("e1", "c1", "api")
                },
                EdgeDefinition {
                    source_handle: Some("false".to_string()),
                    ..edge("e2", "c1", "db")
                },
            ],
            "c1",
        );

        let store = Arc::new(InMemoryExecutionEventStore::new());
        let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

        let p = params(&def, json!({}));
        let execution_id = p.execution_id;
        engine.start(p).await.unwrap();

        let snapshot =
            wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
        assert!(snapshot.outputs.get(executed).is_some());
        assert!(snapshot.outputs.get(skipped).is_none());
    }
}

#[tokio::test]
async fn retry_succeeds_within_budget() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(
        "http",
        Arc::new(FlakyExecutor {
            remaining_failures: AtomicU32::new(2),
            output: json!({"status": 200}),
        }),
    );

    let def = definition(vec![node("n1", "http", json!({}))], vec![], "n1");

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine_with(store, registry, observer.clone());

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    assert_eq!(snapshot.outputs["n1"]["status"], 200);

    // Two failed attempts surfaced before the third succeeded.
    let failed = observer
        .names()
        .iter()
        .filter(|n| n.as_str() == "node.failed")
        .count();
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn retry_exhaustion_applies_fallback() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(
        "http",
        Arc::new(FlakyExecutor {
            remaining_failures: AtomicU32::new(u32::MAX),
            output: json!(null),
        }),
    );
    registry.register("transform", Arc::new(EchoExecutor));

    let mut n1 = node("n1", "http", json!({}));
    n1.on_error = Some(OnErrorPolicy {
        strategy: ErrorStrategy::Fallback,
        fallback_value: Some(json!({"ok": false})),
        goto_node: None,
    });
    let def = definition(
        vec![n1, node("n2", "transform", json!({"sawFallback": "${n1.ok}"}))],
        vec![edge("e1", "n1", "n2")],
        "n1",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    assert_eq!(snapshot.outputs["n1"], json!({"ok": false}));
    assert_eq!(snapshot.outputs["n2"]["sawFallback"], false);
}

#[tokio::test]
async fn unhandled_failure_fails_the_execution() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(
        "http",
        Arc::new(FlakyExecutor {
            remaining_failures: AtomicU32::new(u32::MAX),
            output: json!(null),
        }),
    );

    let def = definition(vec![node("n1", "http", json!({}))], vec![], "n1");

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Failed).await;
    let error = snapshot.error.expect("failed execution carries its error");
    assert_eq!(error.kind, ErrorKind::Server);
    assert_eq!(error.failed_node.as_deref(), Some("n1"));
}

#[tokio::test]
async fn human_in_the_loop_round_trip() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("transform", Arc::new(EchoExecutor));

    let def = definition(
        vec![
            node("ask", node_types::USER_INPUT, json!({"prompt": "say something"})),
            node("n2", "transform", json!("${ask}")),
        ],
        vec![edge("e1", "ask", "n2")],
        "ask",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot =
        wait_for_status(&engine, execution_id, &def, ExecutionStatus::WaitingForInput).await;
    assert_eq!(snapshot.waiting_on, vec!["ask".to_string()]);

    engine
        .signal(execution_id, ExecutionSignal::user_input("ask", json!("hello")))
        .await
        .unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    assert_eq!(snapshot.outputs["n2"], "hello");
}

#[tokio::test]
async fn cancellation_during_delay() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("transform", Arc::new(EchoExecutor));

    let def = definition(
        vec![
            node("n1", node_types::DELAY, json!({"seconds": 60})),
            node("n2", "transform", json!({})),
        ],
        vec![edge("e1", "n1", "n2")],
        "n1",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine_with(store, registry, observer.clone());

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine
        .signal(execution_id, ExecutionSignal::cancel("user requested"))
        .await
        .unwrap();

    wait_for_status(&engine, execution_id, &def, ExecutionStatus::Cancelled).await;

    // The successor never started.
    let names = observer.names();
    let n2_started = observer
        .events
        .lock()
        .iter()
        .any(|e| e.name == "node.started" && e.data["node"] == "n2");
    assert!(!n2_started, "n2 started despite cancellation: {names:?}");
}

#[tokio::test]
async fn loop_aggregates_outputs_in_input_order() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("transform", Arc::new(EchoExecutor));

    let body = json!({
        "name": "body",
        "nodes": {
            "double": {
                "type": "transform",
                "name": "double",
                "config": {"item": "${item}", "index": "${index}"},
                "position": {"x": 0.0, "y": 0.0}
            }
        },
        "edges": [],
        "entryPoint": "double"
    });

    let def = definition(
        vec![node(
            "each",
            node_types::LOOP,
            json!({"items": "${inputs.list}", "body": body}),
        )],
        vec![],
        "each",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({"list": [10, 20, 30]}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    let iterations = snapshot.outputs["each"].as_array().unwrap();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[0]["double"]["item"], 10);
    assert_eq!(iterations[0]["double"]["index"], 0);
    assert_eq!(iterations[2]["double"]["item"], 30);
    assert_eq!(iterations[2]["double"]["index"], 2);
}

#[tokio::test]
async fn resume_after_restart_picks_up_waiting_execution() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("transform", Arc::new(EchoExecutor));

    let def = definition(
        vec![
            node("ask", node_types::USER_INPUT, json!({})),
            node("n2", "transform", json!("${ask}")),
        ],
        vec![edge("e1", "ask", "n2")],
        "ask",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let first = engine_with(
        store.clone(),
        registry.clone(),
        Arc::new(RecordingObserver::default()),
    );

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    let user_id = p.user_id;
    first.start(p.clone()).await.unwrap();
    wait_for_status(&first, execution_id, &def, ExecutionStatus::WaitingForInput).await;

    // A "restarted" process: fresh engine, same store.
    let second = engine_with(store.clone(), registry, Arc::new(RecordingObserver::default()));
    assert_eq!(second.unfinished().await.unwrap(), vec![execution_id]);
    second
        .resume(ExecutionParams {
            execution_id,
            user_id,
            definition: def.clone(),
            inputs: json!({}),
            trigger: None,
        })
        .await
        .unwrap();

    second
        .signal(execution_id, ExecutionSignal::user_input("ask", json!("after restart")))
        .await
        .unwrap();

    let snapshot = wait_for_status(&second, execution_id, &def, ExecutionStatus::Completed).await;
    assert_eq!(snapshot.outputs["n2"], "after restart");
}

#[tokio::test]
async fn concurrency_cap_is_respected_under_load() {
    struct GatedExecutor {
        concurrent: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NodeExecutor for GatedExecutor {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new("test", false)
        }

        async fn execute(
            &self,
            _config: Value,
            _inputs: Value,
            _ctx: &dyn NodeContext,
        ) -> Result<Value, NodeError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    }

    let concurrent = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(
        "http",
        Arc::new(GatedExecutor {
            concurrent: concurrent.clone(),
            peak: peak.clone(),
        }),
    );

    let mut nodes = vec![node("root", "http", json!({}))];
    let mut edges = Vec::new();
    for i in 0..6 {
        let name = format!("w{i}");
        nodes.push(node(&name, "http", json!({})));
        edges.push(edge(&format!("e{i}"), "root", &name));
    }
    let mut def = definition(nodes, edges, "root");
    def.settings = Some(WorkflowSettings {
        timeout: None,
        max_concurrent_nodes: Some(2),
        enable_cache: None,
    });

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the cap",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn node_timeout_is_classified_as_timeout() {
    struct HangingExecutor;

    #[async_trait]
    impl NodeExecutor for HangingExecutor {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new("test", true).with_timeout(Duration::from_millis(50))
        }

        async fn execute(
            &self,
            _config: Value,
            _inputs: Value,
            _ctx: &dyn NodeContext,
        ) -> Result<Value, NodeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    }

    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("http", Arc::new(HangingExecutor));

    let def = definition(vec![node("n1", "http", json!({}))], vec![], "n1");

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store, registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();

    let snapshot = wait_for_status(&engine, execution_id, &def, ExecutionStatus::Failed).await;
    assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn node_names_in_history_are_subset_of_definition() {
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("http", Arc::new(StaticExecutor(json!({"x": 1}))));
    registry.register("transform", Arc::new(EchoExecutor));

    let def = definition(
        vec![
            node("n1", "http", json!({})),
            node("n2", "transform", json!({})),
        ],
        vec![edge("e1", "n1", "n2")],
        "n1",
    );

    let store = Arc::new(InMemoryExecutionEventStore::new());
    let engine = engine_with(store.clone(), registry, Arc::new(RecordingObserver::default()));

    let p = params(&def, json!({}));
    let execution_id = p.execution_id;
    engine.start(p).await.unwrap();
    wait_for_status(&engine, execution_id, &def, ExecutionStatus::Completed).await;

    let names: BTreeMap<String, ()> = def.nodes.keys().map(|k| (k.clone(), ())).collect();
    for (_, event) in store.load_events(execution_id).await.unwrap() {
        if let Some(node) = event.node() {
            assert!(names.contains_key(node), "unknown node {node} in history");
        }
    }
}
