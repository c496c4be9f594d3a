//! Async engine runner
//!
//! [`Engine`] drives executions: it owns the event store, the executor
//! registry, and every side effect (executor calls, timers, retries, journal
//! writes, status updates, fan-out publication). Per execution it runs one
//! task — the drive loop — which keeps the state machine and the persisted
//! history in lockstep: propose actions, persist the implied event, fold it
//! back, perform the effect.
//!
//! Within one execution the loop is single-threaded, so persisted
//! transitions are totally ordered; parallelism exists across executions and
//! across the node tasks one execution spawns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowmaestro_core::{
    node_types, ErrorKind, ExecutionError, ExecutorRegistry, Interpolator, LogLevel,
    NodeContext, NodeError, Rendered, ResolutionMode, Scope, VariableScope, WorkflowDefinition,
};

use crate::action::EngineAction;
use crate::event::ExecutionEvent;
use crate::journal::{Journal, JournalEntry, NullJournal, NullStatusSink, StatusSink, StatusUpdate};
use crate::machine::{ExecutionSnapshot, GraphMachine};
use crate::observer::{EngineEvent, EngineObserver, NullObserver};
use crate::retry::RetryPolicy;
use crate::signal::{ExecutionSignal, SignalEnvelope};
use crate::store::{ExecutionEventStore, ExecutionStatus, StoreError};

/// Configuration for the engine runner.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry policy applied to retryable node failures.
    pub retry_policy: RetryPolicy,

    /// Deadline for a single executor invocation when neither the executor
    /// metadata nor the node config says otherwise.
    pub default_node_timeout: Duration,

    /// How long cancelled executions wait for in-flight nodes before
    /// abandoning them.
    pub cancel_grace: Duration,

    /// How unresolved interpolation paths are handled.
    pub resolution_mode: ResolutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            default_node_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            resolution_mode: ResolutionMode::Lenient,
        }
    }
}

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid definition: {0}")]
    Definition(#[from] flowmaestro_core::DefinitionError),

    #[error("execution {0} already reached a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything needed to start (or re-drive) one execution.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub execution_id: Uuid,
    pub user_id: Uuid,

    /// The pinned definition snapshot. Callers load this from the version
    /// store, never from the mutable workflow row.
    pub definition: WorkflowDefinition,

    pub inputs: Value,
    pub trigger: Option<Value>,
}

/// Messages feeding the drive loop.
enum DriveMsg {
    NodeResult {
        node: String,
        attempt: u32,
        result: Result<Value, NodeError>,
    },
    TimerFired {
        node: String,
    },
    RetryReady {
        node: String,
        attempt: u32,
    },
    Signal(SignalEnvelope),
    GraceExpired,
    Deadline,
}

struct LiveHandle {
    msg_tx: mpsc::UnboundedSender<DriveMsg>,
}

/// Per-drive shared context cloned into spawned tasks.
#[derive(Clone)]
struct DriveEnv {
    execution_id: Uuid,
    user_id: Uuid,
    definition: Arc<WorkflowDefinition>,
    msg_tx: mpsc::UnboundedSender<DriveMsg>,
    cancel: CancellationToken,
    workflow_vars: Arc<RwLock<Map<String, Value>>>,
}

/// The durable engine runner.
pub struct Engine<S: ExecutionEventStore> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    journal: Arc<dyn Journal>,
    status_sink: Arc<dyn StatusSink>,
    observer: Arc<dyn EngineObserver>,
    config: EngineConfig,

    /// Global-scoped variables, shared per user, last write wins.
    globals: Arc<DashMap<(Uuid, String), Value>>,

    /// Drive loops currently running in this process.
    live: DashMap<Uuid, LiveHandle>,
}

impl<S: ExecutionEventStore> Engine<S> {
    pub fn new(store: S, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            store: Arc::new(store),
            registry,
            journal: Arc::new(NullJournal),
            status_sink: Arc::new(NullStatusSink),
            observer: Arc::new(NullObserver),
            config: EngineConfig::default(),
            globals: Arc::new(DashMap::new()),
            live: DashMap::new(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start a brand-new execution: validate the definition, persist the
    /// start event, and spawn the drive loop.
    pub async fn start(self: &Arc<Self>, params: ExecutionParams) -> Result<(), EngineError> {
        params.definition.validate()?;

        self.store.create_execution(params.execution_id).await?;
        self.store
            .append_events(
                params.execution_id,
                0,
                vec![ExecutionEvent::ExecutionStarted {
                    inputs: params.inputs.clone(),
                    trigger: params.trigger.clone(),
                }],
            )
            .await?;

        // The start event is appended outside the drive loop, so its
        // journal entry and fan-out publication happen here. The dedupe key
        // keeps the entry single under crash-and-retry.
        let _ = self
            .journal
            .append(
                JournalEntry::engine(params.execution_id, LogLevel::Info, "execution started")
                    .with_dedupe("evt-0"),
            )
            .await;
        self.observer.publish(EngineEvent::new(
            params.execution_id,
            params.user_id,
            "execution.started",
            serde_json::json!({ "inputs": params.inputs }),
        ));

        info!(execution_id = %params.execution_id, workflow = %params.definition.name, "execution started");
        self.spawn_drive(params);
        Ok(())
    }

    /// Re-drive an execution from its persisted history after a restart.
    pub async fn resume(self: &Arc<Self>, params: ExecutionParams) -> Result<(), EngineError> {
        let events = self.store.load_events(params.execution_id).await?;
        if events.iter().any(|(_, e)| e.is_terminal()) {
            return Err(EngineError::AlreadyTerminal(params.execution_id));
        }

        info!(execution_id = %params.execution_id, "resuming execution");
        self.spawn_drive(params);
        Ok(())
    }

    /// Executions with no terminal event; feed these back through
    /// [`Engine::resume`] at startup.
    pub async fn unfinished(&self) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.store.unfinished_executions().await?)
    }

    /// Deliver a signal. Persisted first (at-least-once), then nudged into
    /// the live drive loop when one exists in this process.
    pub async fn signal(
        &self,
        execution_id: Uuid,
        signal: ExecutionSignal,
    ) -> Result<i64, EngineError> {
        let id = self.store.send_signal(execution_id, signal.clone()).await?;

        if let Some(handle) = self.live.get(&execution_id) {
            let _ = handle.msg_tx.send(DriveMsg::Signal(SignalEnvelope {
                id,
                signal,
                sent_at: Utc::now(),
            }));
        }

        Ok(id)
    }

    /// Read-only snapshot of current state; replays the history without
    /// touching the live loop.
    pub async fn describe(
        &self,
        execution_id: Uuid,
        definition: WorkflowDefinition,
    ) -> Result<ExecutionSnapshot, EngineError> {
        let events = self.store.load_events(execution_id).await?;
        let machine = GraphMachine::replay(definition, events.iter().map(|(_, e)| e));
        Ok(machine.snapshot())
    }

    /// Whether a drive loop for the execution is running in this process.
    pub fn is_live(&self, execution_id: Uuid) -> bool {
        self.live.contains_key(&execution_id)
    }

    // =========================================================================
    // Drive loop
    // =========================================================================

    fn spawn_drive(self: &Arc<Self>, params: ExecutionParams) {
        let engine = self.clone();
        tokio::spawn(async move {
            let execution_id = params.execution_id;
            if let Err(err) = engine.drive(params).await {
                error!(%execution_id, error = %err, "drive loop aborted");
                let _ = engine
                    .status_sink
                    .update(StatusUpdate {
                        execution_id,
                        status: ExecutionStatus::Failed,
                        outputs: None,
                        error: Some(ExecutionError::new(ErrorKind::Unknown, err.to_string())),
                    })
                    .await;
            }
            engine.live.remove(&execution_id);
        });
    }

    async fn drive(self: &Arc<Self>, params: ExecutionParams) -> Result<(), EngineError> {
        let execution_id = params.execution_id;
        let events = self.store.load_events(execution_id).await?;
        let mut seq = events.len() as i64;
        let mut machine = GraphMachine::replay(
            params.definition.clone(),
            events.iter().map(|(_, e)| e),
        );

        if machine.is_terminal() {
            return Ok(());
        }

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        self.live.insert(
            execution_id,
            LiveHandle {
                msg_tx: msg_tx.clone(),
            },
        );

        let env = DriveEnv {
            execution_id,
            user_id: params.user_id,
            definition: Arc::new(params.definition.clone()),
            msg_tx: msg_tx.clone(),
            cancel: CancellationToken::new(),
            workflow_vars: Arc::new(RwLock::new(Map::new())),
        };

        // Recovery: variable writes are effects, so they are rebuilt from
        // the recorded outputs of completed `variable` nodes.
        for (_, event) in &events {
            if let ExecutionEvent::NodeCompleted { node, output } = event {
                if env
                    .definition
                    .node(node)
                    .is_some_and(|n| n.node_type == node_types::VARIABLE)
                {
                    self.apply_variable_output(&env, output);
                }
            }
        }

        // Re-issue whatever the previous process had in flight.
        for (node, attempt) in machine.running_nodes() {
            debug!(%execution_id, %node, attempt, "re-dispatching in-flight node after replay");
            self.launch_node(&machine, &env, &node, attempt);
        }
        for (node, failed_attempt) in machine.backoff_nodes() {
            self.arm_retry(&env, node, failed_attempt + 1);
        }
        for (node, fire_at) in machine.sleeping_nodes() {
            let remaining = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.arm_timer(&env, node, remaining);
        }
        let offline_signals = self
            .store
            .pending_signals(execution_id, machine.last_signal_id())
            .await?;
        for envelope in offline_signals {
            let _ = msg_tx.send(DriveMsg::Signal(envelope));
        }

        self.push_status(&machine, execution_id).await;

        if let Some(secs) = env.definition.timeout_secs() {
            let tx = msg_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                let _ = tx.send(DriveMsg::Deadline);
            });
        }

        let mut grace_armed = false;

        loop {
            // Drain proposals; each performed action folds its event back
            // before the next proposal round.
            let mut terminal = false;
            loop {
                let actions = machine.next_actions();
                if actions.is_empty() {
                    break;
                }
                for action in actions {
                    if self.perform(&mut machine, &mut seq, &env, action).await? {
                        terminal = true;
                        break;
                    }
                }
                if terminal {
                    break;
                }
            }
            if terminal {
                break;
            }

            if machine.is_cancelled() && !grace_armed {
                grace_armed = true;
                env.cancel.cancel();
                let tx = msg_tx.clone();
                let grace = self.config.cancel_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(DriveMsg::GraceExpired);
                });
            }

            let Some(msg) = msg_rx.recv().await else {
                break;
            };
            if self.handle_msg(&mut machine, &mut seq, &env, msg).await? {
                break;
            }
        }

        Ok(())
    }

    async fn handle_msg(
        self: &Arc<Self>,
        machine: &mut GraphMachine,
        seq: &mut i64,
        env: &DriveEnv,
        msg: DriveMsg,
    ) -> Result<bool, EngineError> {
        match msg {
            DriveMsg::NodeResult {
                node,
                attempt,
                result,
            } => {
                // Results from abandoned dispatches (stale attempt or a
                // terminal machine) are ignored.
                if machine.is_terminal()
                    || !machine
                        .running_nodes()
                        .iter()
                        .any(|(n, a)| n == &node && *a == attempt)
                {
                    return Ok(false);
                }
                match result {
                    Ok(output) => {
                        if env
                            .definition
                            .node(&node)
                            .is_some_and(|n| n.node_type == node_types::VARIABLE)
                        {
                            self.apply_variable_output(env, &output);
                        }
                        self.record(
                            machine,
                            seq,
                            env,
                            ExecutionEvent::NodeCompleted { node, output },
                        )
                        .await?;
                    }
                    Err(error) => {
                        let will_retry = error.retryable
                            && self.config.retry_policy.has_attempts_remaining(attempt)
                            && !machine.is_cancelled();
                        self.record(
                            machine,
                            seq,
                            env,
                            ExecutionEvent::NodeFailed {
                                node: node.clone(),
                                error,
                                will_retry,
                            },
                        )
                        .await?;
                        if will_retry {
                            self.arm_retry(env, node, attempt + 1);
                        }
                    }
                }
            }

            DriveMsg::RetryReady { node, attempt } => {
                let in_backoff = machine
                    .backoff_nodes()
                    .iter()
                    .any(|(n, _)| n == &node);
                if in_backoff && !machine.is_cancelled() && !machine.is_terminal() {
                    self.record(
                        machine,
                        seq,
                        env,
                        ExecutionEvent::NodeStarted {
                            node: node.clone(),
                            attempt,
                        },
                    )
                    .await?;
                    self.launch_node(machine, env, &node, attempt);
                }
            }

            DriveMsg::TimerFired { node } => {
                let sleeping = machine.sleeping_nodes().iter().any(|(n, _)| n == &node);
                if sleeping && !machine.is_terminal() {
                    self.record(machine, seq, env, ExecutionEvent::TimerFired { node })
                        .await?;
                }
            }

            DriveMsg::Signal(envelope) => {
                if envelope.id <= machine.last_signal_id() || machine.is_terminal() {
                    return Ok(false);
                }
                let was_waiting = machine.status() == ExecutionStatus::WaitingForInput;
                self.record(
                    machine,
                    seq,
                    env,
                    ExecutionEvent::SignalReceived {
                        id: envelope.id,
                        signal: envelope.signal.clone(),
                    },
                )
                .await?;

                if let ExecutionSignal::UserInput { node, payload } = &envelope.signal {
                    // The paused node's output is finalized by the signal.
                    self.publish(
                        env,
                        "node.completed",
                        serde_json::json!({ "node": node, "output": payload }),
                    );
                    if was_waiting && machine.status() == ExecutionStatus::Running {
                        self.push_status(machine, env.execution_id).await;
                    }
                }
            }

            DriveMsg::GraceExpired => {
                if !machine.is_terminal() && machine.is_cancelled() {
                    // In-flight nodes did not observe cancellation in time;
                    // abandon them and record the terminal state.
                    warn!(execution_id = %env.execution_id, "cancel grace expired with nodes in flight");
                    let reason = "cancelled".to_string();
                    self.record(
                        machine,
                        seq,
                        env,
                        ExecutionEvent::ExecutionCancelled { reason },
                    )
                    .await?;
                    return Ok(true);
                }
            }

            DriveMsg::Deadline => {
                if !machine.is_terminal() {
                    self.record(
                        machine,
                        seq,
                        env,
                        ExecutionEvent::ExecutionFailed {
                            error: ExecutionError::new(
                                ErrorKind::Timeout,
                                "execution exceeded its configured timeout",
                            ),
                        },
                    )
                    .await?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Perform one proposed action. Returns true when the execution reached
    /// a terminal state.
    async fn perform(
        self: &Arc<Self>,
        machine: &mut GraphMachine,
        seq: &mut i64,
        env: &DriveEnv,
        action: EngineAction,
    ) -> Result<bool, EngineError> {
        match action {
            EngineAction::DispatchNode { node, attempt } => {
                let node_type = env
                    .definition
                    .node(&node)
                    .map(|n| n.node_type.clone())
                    .unwrap_or_default();

                match node_type.as_str() {
                    node_types::USER_INPUT => {
                        self.record(
                            machine,
                            seq,
                            env,
                            ExecutionEvent::InputRequested { node },
                        )
                        .await?;
                        self.push_status(machine, env.execution_id).await;
                    }

                    node_types::DELAY => {
                        match self.delay_duration(machine, env, &node) {
                            Ok(duration) => {
                                let fire_at = Utc::now()
                                    + chrono::Duration::from_std(duration)
                                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                                self.record(
                                    machine,
                                    seq,
                                    env,
                                    ExecutionEvent::TimerStarted {
                                        node: node.clone(),
                                        duration_ms: duration.as_millis() as u64,
                                        fire_at,
                                    },
                                )
                                .await?;
                                self.arm_timer(env, node, duration);
                            }
                            Err(error) => {
                                self.record(
                                    machine,
                                    seq,
                                    env,
                                    ExecutionEvent::NodeStarted {
                                        node: node.clone(),
                                        attempt,
                                    },
                                )
                                .await?;
                                self.record(
                                    machine,
                                    seq,
                                    env,
                                    ExecutionEvent::NodeFailed {
                                        node,
                                        error,
                                        will_retry: false,
                                    },
                                )
                                .await?;
                            }
                        }
                    }

                    _ => {
                        self.record(
                            machine,
                            seq,
                            env,
                            ExecutionEvent::NodeStarted {
                                node: node.clone(),
                                attempt,
                            },
                        )
                        .await?;
                        self.launch_node(machine, env, &node, attempt);
                    }
                }
            }

            EngineAction::SkipNode { node, reason } => {
                self.record(machine, seq, env, ExecutionEvent::NodeSkipped { node, reason })
                    .await?;
            }

            EngineAction::CompleteExecution { outputs } => {
                self.record(
                    machine,
                    seq,
                    env,
                    ExecutionEvent::ExecutionCompleted { outputs },
                )
                .await?;
                return Ok(true);
            }

            EngineAction::FailExecution { error } => {
                self.record(machine, seq, env, ExecutionEvent::ExecutionFailed { error })
                    .await?;
                return Ok(true);
            }

            EngineAction::CancelExecution { reason } => {
                self.record(
                    machine,
                    seq,
                    env,
                    ExecutionEvent::ExecutionCancelled { reason },
                )
                .await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Append one event, fold it into the machine, and emit its journal,
    /// status, and fan-out effects. The journal entry dedupes on the event's
    /// sequence so a crashed-and-replayed drive never writes doubles.
    async fn record(
        self: &Arc<Self>,
        machine: &mut GraphMachine,
        seq: &mut i64,
        env: &DriveEnv,
        event: ExecutionEvent,
    ) -> Result<(), EngineError> {
        let event_seq = *seq;
        *seq = self
            .store
            .append_events(env.execution_id, event_seq, vec![event.clone()])
            .await?;
        machine.apply(&event);
        self.emit_effects(machine, env, event_seq, &event).await;
        Ok(())
    }

    async fn emit_effects(
        self: &Arc<Self>,
        machine: &GraphMachine,
        env: &DriveEnv,
        event_seq: i64,
        event: &ExecutionEvent,
    ) {
        let execution_id = env.execution_id;
        let dedupe = format!("evt-{event_seq}");

        let entry = match event {
            ExecutionEvent::ExecutionStarted { .. } => Some(JournalEntry::engine(
                execution_id,
                LogLevel::Info,
                "execution started",
            )),
            ExecutionEvent::NodeStarted { node, attempt } => Some(
                JournalEntry::node(
                    execution_id,
                    node.clone(),
                    LogLevel::Info,
                    format!("node started (attempt {attempt})"),
                )
                .with_payload(serde_json::json!({ "attempt": attempt })),
            ),
            ExecutionEvent::NodeCompleted { node, .. } => Some(JournalEntry::node(
                execution_id,
                node.clone(),
                LogLevel::Info,
                "node completed",
            )),
            ExecutionEvent::NodeFailed {
                node,
                error,
                will_retry,
            } => Some(
                JournalEntry::node(
                    execution_id,
                    node.clone(),
                    LogLevel::Error,
                    format!("node failed: {}", error.message),
                )
                .with_payload(serde_json::json!({
                    "kind": error.kind,
                    "attempt": machine.node_state(node).map(|s| s.attempt),
                    "willRetry": will_retry,
                })),
            ),
            ExecutionEvent::NodeSkipped { node, reason } => Some(JournalEntry::node(
                execution_id,
                node.clone(),
                LogLevel::Debug,
                format!("node skipped: {reason}"),
            )),
            ExecutionEvent::TimerStarted {
                node, duration_ms, ..
            } => Some(JournalEntry::node(
                execution_id,
                node.clone(),
                LogLevel::Info,
                format!("delay started ({duration_ms}ms)"),
            )),
            ExecutionEvent::TimerFired { node } => Some(JournalEntry::node(
                execution_id,
                node.clone(),
                LogLevel::Info,
                "delay elapsed",
            )),
            ExecutionEvent::InputRequested { node } => Some(JournalEntry::node(
                execution_id,
                node.clone(),
                LogLevel::Info,
                "waiting for user input",
            )),
            ExecutionEvent::SignalReceived { signal, .. } => Some(JournalEntry::engine(
                execution_id,
                LogLevel::Info,
                match signal {
                    ExecutionSignal::UserInput { node, .. } => {
                        format!("user input delivered to {node}")
                    }
                    ExecutionSignal::Cancel { reason } => {
                        format!("cancellation requested: {reason}")
                    }
                },
            )),
            ExecutionEvent::ExecutionCompleted { .. } => Some(JournalEntry::engine(
                execution_id,
                LogLevel::Info,
                "execution completed",
            )),
            ExecutionEvent::ExecutionFailed { error } => Some(JournalEntry::engine(
                execution_id,
                LogLevel::Error,
                format!("execution failed: {}", error.message),
            )),
            ExecutionEvent::ExecutionCancelled { reason } => Some(JournalEntry::engine(
                execution_id,
                LogLevel::Info,
                format!("execution cancelled: {reason}"),
            )),
        };

        if let Some(entry) = entry {
            self.append_journal(env, entry.with_dedupe(dedupe)).await;
        }

        if let Some(name) = event.fanout_name() {
            let data = match event {
                ExecutionEvent::ExecutionStarted { inputs, .. } => {
                    serde_json::json!({ "inputs": inputs })
                }
                ExecutionEvent::ExecutionCompleted { outputs } => {
                    serde_json::json!({ "outputs": outputs })
                }
                ExecutionEvent::ExecutionFailed { error } => serde_json::json!({ "error": error }),
                ExecutionEvent::ExecutionCancelled { reason } => {
                    serde_json::json!({ "reason": reason })
                }
                ExecutionEvent::NodeStarted { node, attempt } => {
                    serde_json::json!({ "node": node, "attempt": attempt })
                }
                ExecutionEvent::NodeCompleted { node, output } => {
                    serde_json::json!({ "node": node, "output": output })
                }
                ExecutionEvent::TimerFired { node } => {
                    serde_json::json!({ "node": node, "output": null })
                }
                ExecutionEvent::NodeFailed {
                    node,
                    error,
                    will_retry,
                } => serde_json::json!({ "node": node, "error": error, "willRetry": will_retry }),
                _ => Value::Null,
            };
            self.publish(env, name, data);
        }

        if event.is_terminal() {
            let (status, outputs, error) = match event {
                ExecutionEvent::ExecutionCompleted { outputs } => {
                    (ExecutionStatus::Completed, Some(outputs.clone()), None)
                }
                ExecutionEvent::ExecutionFailed { error } => {
                    (ExecutionStatus::Failed, None, Some(error.clone()))
                }
                _ => (ExecutionStatus::Cancelled, None, None),
            };
            let _ = self
                .status_sink
                .update(StatusUpdate {
                    execution_id,
                    status,
                    outputs,
                    error,
                })
                .await;
        } else if matches!(event, ExecutionEvent::ExecutionStarted { .. }) {
            self.push_status(machine, execution_id).await;
        }
    }

    async fn push_status(&self, machine: &GraphMachine, execution_id: Uuid) {
        let _ = self
            .status_sink
            .update(StatusUpdate {
                execution_id,
                status: machine.status(),
                outputs: None,
                error: None,
            })
            .await;
    }

    async fn append_journal(self: &Arc<Self>, env: &DriveEnv, entry: JournalEntry) {
        let node = entry.node.clone();
        let level = entry.level;
        let message = entry.message.clone();
        if let Err(err) = self.journal.append(entry).await {
            warn!(execution_id = %env.execution_id, error = %err, "journal append failed");
            return;
        }
        self.publish(
            env,
            "log.appended",
            serde_json::json!({
                "node": node,
                "level": level,
                "message": message,
            }),
        );
    }

    fn publish(&self, env: &DriveEnv, name: &str, data: Value) {
        self.observer.publish(EngineEvent::new(
            env.execution_id,
            env.user_id,
            name,
            data,
        ));
    }

    // =========================================================================
    // Node dispatch
    // =========================================================================

    /// Interpolate config against the current scope and spawn the executor
    /// task. The prepared inputs are captured here, inside the drive loop,
    /// so the task itself never touches machine state.
    fn launch_node(
        self: &Arc<Self>,
        machine: &GraphMachine,
        env: &DriveEnv,
        node: &str,
        attempt: u32,
    ) {
        let Some(node_def) = env.definition.node(node) else {
            let _ = env.msg_tx.send(DriveMsg::NodeResult {
                node: node.to_string(),
                attempt,
                result: Err(NodeError::validation(format!("unknown node {node:?}"))),
            });
            return;
        };

        let scope = self.build_scope(machine, env);
        let interpolator = Interpolator::new(self.config.resolution_mode);
        let prepared = if node_def.node_type == node_types::LOOP {
            render_loop_config(&interpolator, &node_def.config, &scope)
        } else {
            interpolator.render_value(&node_def.config, &scope)
        };
        let inputs = machine.node_inputs(node);
        let node_type = node_def.node_type.clone();

        let engine = self.clone();
        let env = env.clone();
        let node = node.to_string();
        tokio::spawn(async move {
            let result = match prepared {
                Ok(rendered) => {
                    for warning in &rendered.warnings {
                        engine
                            .append_journal(
                                &env,
                                JournalEntry::node(
                                    env.execution_id,
                                    node.clone(),
                                    LogLevel::Warn,
                                    warning.clone(),
                                ),
                            )
                            .await;
                    }
                    engine
                        .execute_prepared(&env, &node, &node_type, rendered.value, inputs, scope)
                        .await
                }
                Err(error) => Err(error),
            };
            let _ = env.msg_tx.send(DriveMsg::NodeResult {
                node,
                attempt,
                result,
            });
        });
    }

    async fn execute_prepared(
        self: &Arc<Self>,
        env: &DriveEnv,
        node: &str,
        node_type: &str,
        config: Value,
        inputs: Value,
        scope: Scope,
    ) -> Result<Value, NodeError> {
        if node_type == node_types::LOOP {
            return self.run_loop(env, node, &config, scope).await;
        }

        let Some(executor) = self.registry.get(node_type) else {
            return Err(NodeError::validation(format!(
                "no executor registered for node type {node_type:?}"
            )));
        };

        let timeout = config
            .get("timeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                let meta = executor.metadata();
                if meta.default_timeout.is_zero() {
                    self.config.default_node_timeout
                } else {
                    meta.default_timeout
                }
            });

        let ctx = self.node_ctx(env, node);
        match tokio::time::timeout(timeout, executor.execute(config, inputs, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::timeout(format!(
                "node exceeded its {}s timeout",
                timeout.as_secs()
            ))),
        }
    }

    fn node_ctx(&self, env: &DriveEnv, node: &str) -> NodeCtx {
        NodeCtx {
            execution_id: env.execution_id,
            user_id: env.user_id,
            node: node.to_string(),
            journal: self.journal.clone(),
            observer: self.observer.clone(),
            workflow_vars: env.workflow_vars.clone(),
            globals: self.globals.clone(),
            temp: Arc::new(RwLock::new(Map::new())),
            cancel: env.cancel.child_token(),
        }
    }

    fn build_scope(&self, machine: &GraphMachine, env: &DriveEnv) -> Scope {
        let outputs = machine.completed_outputs();

        let mut variables = Map::new();
        for entry in self.globals.iter() {
            let (user_id, name) = entry.key();
            if *user_id == env.user_id {
                variables.insert(name.clone(), entry.value().clone());
            }
        }
        for (name, value) in env.workflow_vars.read().iter() {
            variables.insert(name.clone(), value.clone());
        }

        let mut base = Map::new();
        base.insert("inputs".to_string(), machine.inputs().clone());
        if let Some(trigger) = machine.trigger() {
            base.insert("trigger".to_string(), trigger.clone());
        }
        base.insert("variables".to_string(), Value::Object(variables));
        base.insert("outputs".to_string(), Value::Object(outputs.clone()));

        let mut scope = Scope::new();
        scope.push_frame(base);
        // Node outputs are addressable directly by node name as well.
        scope.push_frame(outputs);
        scope
    }

    fn delay_duration(
        &self,
        machine: &GraphMachine,
        env: &DriveEnv,
        node: &str,
    ) -> Result<Duration, NodeError> {
        let node_def = env
            .definition
            .node(node)
            .ok_or_else(|| NodeError::validation(format!("unknown node {node:?}")))?;

        let scope = self.build_scope(machine, env);
        let interpolator = Interpolator::new(self.config.resolution_mode);
        let config = interpolator.render_value(&node_def.config, &scope)?.value;

        let duration = if let Some(secs) = config.get("seconds").and_then(value_as_f64) {
            Duration::from_secs_f64(secs)
        } else if let Some(ms) = config.get("durationMs").and_then(value_as_f64) {
            Duration::from_secs_f64(ms / 1000.0)
        } else {
            return Err(NodeError::validation(
                "delay config requires \"seconds\" or \"durationMs\"",
            ));
        };

        if duration > Duration::from_secs(60 * 60 * 24 * 30) {
            return Err(NodeError::validation("delay longer than 30 days"));
        }
        Ok(duration)
    }

    fn arm_timer(self: &Arc<Self>, env: &DriveEnv, node: String, duration: Duration) {
        let tx = env.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(DriveMsg::TimerFired { node });
        });
    }

    fn arm_retry(self: &Arc<Self>, env: &DriveEnv, node: String, attempt: u32) {
        let delay = self.config.retry_policy.delay_for_attempt(attempt);
        let tx = env.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DriveMsg::RetryReady { node, attempt });
        });
    }

    fn apply_variable_output(&self, env: &DriveEnv, output: &Value) {
        let (Some(op), Some(scope), Some(name)) = (
            output.get("operation").and_then(Value::as_str),
            output.get("scope").and_then(Value::as_str),
            output.get("name").and_then(Value::as_str),
        ) else {
            return;
        };

        match (op, scope) {
            ("set", "workflow") => {
                env.workflow_vars.write().insert(
                    name.to_string(),
                    output.get("value").cloned().unwrap_or(Value::Null),
                );
            }
            ("delete", "workflow") => {
                env.workflow_vars.write().remove(name);
            }
            ("set", "global") => {
                self.globals.insert(
                    (env.user_id, name.to_string()),
                    output.get("value").cloned().unwrap_or(Value::Null),
                );
            }
            ("delete", "global") => {
                self.globals.remove(&(env.user_id, name.to_string()));
            }
            _ => {}
        }
    }

    // =========================================================================
    // Loop sub-graphs
    // =========================================================================

    /// Run a `loop` node: its body is an inline sub-definition executed once
    /// per item, sequentially, with `item` and `index` bound in scope.
    /// Outputs aggregate into an array in input order.
    async fn run_loop(
        self: &Arc<Self>,
        env: &DriveEnv,
        node: &str,
        config: &Value,
        scope: Scope,
    ) -> Result<Value, NodeError> {
        let items = config
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| NodeError::validation("loop config requires an \"items\" array"))?;

        let body: WorkflowDefinition =
            serde_json::from_value(config.get("body").cloned().unwrap_or(Value::Null)).map_err(
                |e| NodeError::validation(format!("loop config has an invalid \"body\": {e}")),
            )?;
        body.validate()
            .map_err(|e| NodeError::validation(format!("loop body: {e}")))?;
        for body_node in body.nodes.values() {
            if matches!(
                body_node.node_type.as_str(),
                node_types::USER_INPUT | node_types::DELAY
            ) {
                return Err(NodeError::validation(format!(
                    "node type {:?} is not allowed inside a loop body",
                    body_node.node_type
                )));
            }
        }

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if env.cancel.is_cancelled() {
                return Err(NodeError::cancelled());
            }

            let mut iteration_scope = scope.clone();
            let mut frame = Map::new();
            frame.insert("item".to_string(), item.clone());
            frame.insert("index".to_string(), Value::Number(index.into()));
            iteration_scope.push_frame(frame);

            let outputs = self
                .run_subgraph(env, node, body.clone(), iteration_scope)
                .await?;
            results.push(Value::Object(outputs));
        }

        Ok(Value::Array(results))
    }

    /// Drive a body sub-graph to completion with live (non-durable)
    /// semantics: sequential dispatch, inline retries. Durability stays at
    /// the granularity of the owning loop node.
    fn run_subgraph(
        self: &Arc<Self>,
        env: &DriveEnv,
        loop_node: &str,
        body: WorkflowDefinition,
        base_scope: Scope,
    ) -> BoxFuture<'static, Result<Map<String, Value>, NodeError>> {
        let engine = self.clone();
        let env = env.clone();
        let loop_node = loop_node.to_string();

        Box::pin(async move {
            let mut machine = GraphMachine::new(body.clone());
            machine.apply(&ExecutionEvent::ExecutionStarted {
                inputs: Value::Null,
                trigger: None,
            });

            loop {
                let actions = machine.next_actions();
                let Some(action) = actions.into_iter().next() else {
                    // A body with suspension-free nodes always proposes
                    // until terminal; an empty proposal means a wait state
                    // slipped through validation.
                    return Err(NodeError::validation(
                        "loop body reached a state with nothing to run",
                    ));
                };

                match action {
                    EngineAction::DispatchNode { node, attempt } => {
                        machine.apply(&ExecutionEvent::NodeStarted {
                            node: node.clone(),
                            attempt,
                        });

                        let mut scope = base_scope.clone();
                        scope.push_frame(machine.completed_outputs());

                        let node_def = body
                            .node(&node)
                            .ok_or_else(|| NodeError::validation("unknown body node"))?;
                        let interpolator =
                            Interpolator::new(engine.config.resolution_mode);
                        let config = if node_def.node_type == node_types::LOOP {
                            render_loop_config(&interpolator, &node_def.config, &scope)?.value
                        } else {
                            interpolator.render_value(&node_def.config, &scope)?.value
                        };
                        let inputs = machine.node_inputs(&node);

                        let result = if node_def.node_type == node_types::LOOP {
                            engine.run_loop(&env, &loop_node, &config, scope).await
                        } else {
                            engine
                                .execute_body_node(&env, &loop_node, &node_def.node_type, config, inputs)
                                .await
                        };

                        match result {
                            Ok(output) => {
                                machine.apply(&ExecutionEvent::NodeCompleted { node, output });
                            }
                            Err(error) => {
                                machine.apply(&ExecutionEvent::NodeFailed {
                                    node,
                                    error,
                                    will_retry: false,
                                });
                            }
                        }
                    }

                    EngineAction::SkipNode { node, reason } => {
                        machine.apply(&ExecutionEvent::NodeSkipped { node, reason });
                    }

                    EngineAction::CompleteExecution { outputs } => {
                        let Value::Object(map) = outputs else {
                            return Ok(Map::new());
                        };
                        return Ok(map);
                    }

                    EngineAction::FailExecution { error } => {
                        return Err(NodeError::classified(error.kind, error.message));
                    }

                    EngineAction::CancelExecution { .. } => {
                        return Err(NodeError::cancelled());
                    }
                }
            }
        })
    }

    /// Execute one body node with inline retries.
    async fn execute_body_node(
        self: &Arc<Self>,
        env: &DriveEnv,
        loop_node: &str,
        node_type: &str,
        config: Value,
        inputs: Value,
    ) -> Result<Value, NodeError> {
        let Some(executor) = self.registry.get(node_type) else {
            return Err(NodeError::validation(format!(
                "no executor registered for node type {node_type:?}"
            )));
        };

        let policy = &self.config.retry_policy;
        let timeout = {
            let meta = executor.metadata();
            if meta.default_timeout.is_zero() {
                self.config.default_node_timeout
            } else {
                meta.default_timeout
            }
        };

        let mut attempt = 1;
        loop {
            let ctx = self.node_ctx(env, loop_node);
            let result = match tokio::time::timeout(
                timeout,
                executor.execute(config.clone(), inputs.clone(), &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NodeError::timeout(format!(
                    "body node exceeded its {}s timeout",
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(error) => {
                    if error.retryable
                        && policy.has_attempts_remaining(attempt)
                        && !env.cancel.is_cancelled()
                    {
                        attempt += 1;
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    } else {
                        return Err(error);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Node context
// =============================================================================

struct NodeCtx {
    execution_id: Uuid,
    user_id: Uuid,
    node: String,
    journal: Arc<dyn Journal>,
    observer: Arc<dyn EngineObserver>,
    workflow_vars: Arc<RwLock<Map<String, Value>>>,
    globals: Arc<DashMap<(Uuid, String), Value>>,
    temp: Arc<RwLock<Map<String, Value>>>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl NodeContext for NodeCtx {
    fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    fn node_name(&self) -> &str {
        &self.node
    }

    fn log(&self, level: LogLevel, message: &str, payload: Option<Value>) {
        let mut entry = JournalEntry::node(self.execution_id, self.node.clone(), level, message);
        if let Some(payload) = payload {
            entry = entry.with_payload(payload);
        }

        let journal = self.journal.clone();
        let observer = self.observer.clone();
        let execution_id = self.execution_id;
        let user_id = self.user_id;
        let node = self.node.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            if journal.append(entry).await.is_ok() {
                observer.publish(EngineEvent::new(
                    execution_id,
                    user_id,
                    "log.appended",
                    serde_json::json!({
                        "node": node,
                        "level": level,
                        "message": message,
                    }),
                ));
            }
        });
    }

    async fn get_variable(&self, scope: VariableScope, name: &str) -> Option<Value> {
        match scope {
            VariableScope::Workflow => self.workflow_vars.read().get(name).cloned(),
            VariableScope::Global => self
                .globals
                .get(&(self.user_id, name.to_string()))
                .map(|v| v.value().clone()),
            VariableScope::Temporary => self.temp.read().get(name).cloned(),
        }
    }

    async fn set_variable(
        &self,
        scope: VariableScope,
        name: &str,
        value: Value,
    ) -> Result<(), NodeError> {
        match scope {
            VariableScope::Workflow => {
                self.workflow_vars.write().insert(name.to_string(), value);
            }
            VariableScope::Global => {
                self.globals.insert((self.user_id, name.to_string()), value);
            }
            VariableScope::Temporary => {
                self.temp.write().insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    async fn delete_variable(&self, scope: VariableScope, name: &str) -> Result<(), NodeError> {
        match scope {
            VariableScope::Workflow => {
                self.workflow_vars.write().remove(name);
            }
            VariableScope::Global => {
                self.globals.remove(&(self.user_id, name.to_string()));
            }
            VariableScope::Temporary => {
                self.temp.write().remove(name);
            }
        }
        Ok(())
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Render a `loop` node's config, leaving its `body` sub-definition
/// untouched: body placeholders like `${item}` resolve per iteration, not
/// at dispatch.
fn render_loop_config(
    interpolator: &Interpolator,
    config: &Value,
    scope: &Scope,
) -> Result<Rendered, NodeError> {
    let Value::Object(map) = config else {
        return interpolator.render_value(config, scope);
    };

    let mut rest = map.clone();
    let body = rest.remove("body");

    let mut rendered = interpolator.render_value(&Value::Object(rest), scope)?;
    if let (Value::Object(out), Some(body)) = (&mut rendered.value, body) {
        out.insert("body".to_string(), body);
    }
    Ok(rendered)
}

/// Per-user running-execution counts, read by the trigger supervisor for
/// admission control.
#[derive(Default)]
pub struct RunningCounts {
    counts: DashMap<Uuid, usize>,
}

impl RunningCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, user_id: Uuid) -> usize {
        let mut entry = self.counts.entry(user_id).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn decrement(&self, user_id: Uuid) {
        if let Some(mut entry) = self.counts.get_mut(&user_id) {
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn get(&self, user_id: Uuid) -> usize {
        self.counts.get(&user_id).map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_counts() {
        let counts = RunningCounts::new();
        let user = Uuid::now_v7();

        assert_eq!(counts.get(user), 0);
        assert_eq!(counts.increment(user), 1);
        assert_eq!(counts.increment(user), 2);
        counts.decrement(user);
        assert_eq!(counts.get(user), 1);
        counts.decrement(user);
        counts.decrement(user);
        assert_eq!(counts.get(user), 0);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_node_timeout, Duration::from_secs(30));
        assert_eq!(config.cancel_grace, Duration::from_secs(5));
        assert_eq!(config.retry_policy.max_attempts, 3);
    }
}
