//! Deterministic graph state machine
//!
//! [`GraphMachine`] is the pure core of the engine: it folds
//! [`ExecutionEvent`]s into node state and proposes [`EngineAction`]s, and
//! nothing else. It holds no clock, does no I/O, and produces identical
//! state from an identical event sequence — that property is what makes
//! executions replayable after a crash.
//!
//! The runner owns the protocol: take `next_actions()`, persist the event
//! each action implies, fold it back with `apply()`, perform the side
//! effect, repeat.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use flowmaestro_core::{
    node_types, ErrorStrategy, ExecutionError, NodeError, WorkflowDefinition,
};

use crate::action::EngineAction;
use crate::event::ExecutionEvent;
use crate::signal::ExecutionSignal;
use crate::store::ExecutionStatus;

/// Where a node currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// Not yet dispatched; may or may not be ready.
    Pending,

    /// An executor invocation is in flight.
    Running,

    /// A failed attempt is waiting out its retry backoff.
    Backoff,

    /// A `delay` node is waiting for its timer.
    Sleeping,

    /// A `user-input` node is waiting for a signal.
    AwaitingInput,

    Succeeded,

    /// Terminal failure; the node's error policy has been applied.
    Failed,

    /// Pruned: no inbound edge was satisfied.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub phase: NodePhase,
    pub attempt: u32,
    pub output: Option<Value>,
    pub error: Option<NodeError>,

    /// For `conditional` nodes, the handle the output selected.
    pub selected_handle: Option<String>,

    /// For `delay` nodes, when the recorded timer fires.
    pub fire_at: Option<DateTime<Utc>>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            phase: NodePhase::Pending,
            attempt: 0,
            output: None,
            error: None,
            selected_handle: None,
            fire_at: None,
        }
    }

    fn settled(&self) -> bool {
        matches!(
            self.phase,
            NodePhase::Succeeded | NodePhase::Failed | NodePhase::Skipped
        )
    }
}

/// How an inbound edge currently reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    /// Source not settled yet.
    Unresolved,

    /// Source succeeded on the matching handle.
    Satisfied,

    /// Source settled but this edge will never carry: wrong handle, skipped
    /// source, or a failed source whose policy jumped elsewhere.
    Pruned,
}

/// A point-in-time snapshot answering the `describe` query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionSnapshot {
    pub status: ExecutionStatus,

    /// Nodes that are ready to dispatch right now.
    pub ready: Vec<String>,

    /// Nodes parked on a `user-input` signal.
    pub waiting_on: Vec<String>,

    /// Outputs of every node that has succeeded so far.
    pub outputs: Value,

    pub error: Option<ExecutionError>,
}

/// The deterministic state machine for one execution.
pub struct GraphMachine {
    definition: WorkflowDefinition,
    inputs: Value,
    trigger: Option<Value>,
    started: bool,
    nodes: BTreeMap<String, NodeState>,

    /// Targets of applied `goto` policies: dispatchable regardless of edges.
    forced_ready: BTreeSet<String>,

    cancelled: Option<String>,

    /// First propagated failure; dispatching stops once set.
    failing: Option<ExecutionError>,

    /// Terminal event already folded, if any.
    outcome: Option<ExecutionStatus>,
    outcome_error: Option<ExecutionError>,

    last_signal_id: i64,
}

impl GraphMachine {
    pub fn new(definition: WorkflowDefinition) -> Self {
        let nodes = definition
            .nodes
            .keys()
            .map(|name| (name.clone(), NodeState::new()))
            .collect();
        Self {
            definition,
            inputs: Value::Null,
            trigger: None,
            started: false,
            nodes,
            forced_ready: BTreeSet::new(),
            cancelled: None,
            failing: None,
            outcome: None,
            outcome_error: None,
            last_signal_id: 0,
        }
    }

    /// Rebuild state by folding an event history in sequence order.
    pub fn replay<'a>(
        definition: WorkflowDefinition,
        events: impl IntoIterator<Item = &'a ExecutionEvent>,
    ) -> Self {
        let mut machine = Self::new(definition);
        for event in events {
            machine.apply(event);
        }
        machine
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    pub fn trigger(&self) -> Option<&Value> {
        self.trigger.as_ref()
    }

    pub fn last_signal_id(&self) -> i64 {
        self.last_signal_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn node_state(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// Nodes whose dispatch was recorded but not completed; after a restart
    /// the runner re-issues these.
    pub fn running_nodes(&self) -> Vec<(String, u32)> {
        self.nodes
            .iter()
            .filter(|(_, s)| s.phase == NodePhase::Running)
            .map(|(n, s)| (n.clone(), s.attempt))
            .collect()
    }

    /// Nodes waiting out a retry backoff, with the attempt that failed.
    pub fn backoff_nodes(&self) -> Vec<(String, u32)> {
        self.nodes
            .iter()
            .filter(|(_, s)| s.phase == NodePhase::Backoff)
            .map(|(n, s)| (n.clone(), s.attempt))
            .collect()
    }

    /// Parked `delay` nodes and their recorded fire times.
    pub fn sleeping_nodes(&self) -> Vec<(String, DateTime<Utc>)> {
        self.nodes
            .iter()
            .filter(|(_, s)| s.phase == NodePhase::Sleeping)
            .filter_map(|(n, s)| s.fire_at.map(|at| (n.clone(), at)))
            .collect()
    }

    /// Outputs of all succeeded nodes, keyed by node name.
    pub fn completed_outputs(&self) -> Map<String, Value> {
        self.nodes
            .iter()
            .filter(|(_, s)| s.phase == NodePhase::Succeeded)
            .map(|(n, s)| (n.clone(), s.output.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// Outputs of the satisfied predecessors of `name`, keyed by node name.
    pub fn node_inputs(&self, name: &str) -> Value {
        let mut inputs = Map::new();
        for edge in self.definition.inbound_edges(name) {
            if self.edge_state(edge) == EdgeState::Satisfied {
                if let Some(state) = self.nodes.get(&edge.source) {
                    inputs.insert(
                        edge.source.clone(),
                        state.output.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }
        Value::Object(inputs)
    }

    pub fn status(&self) -> ExecutionStatus {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        if !self.started {
            return ExecutionStatus::Pending;
        }
        if self.cancelled.is_none()
            && self
                .nodes
                .values()
                .any(|s| s.phase == NodePhase::AwaitingInput)
        {
            return ExecutionStatus::WaitingForInput;
        }
        ExecutionStatus::Running
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            status: self.status(),
            ready: self.ready_nodes(),
            waiting_on: self
                .nodes
                .iter()
                .filter(|(_, s)| s.phase == NodePhase::AwaitingInput)
                .map(|(n, _)| n.clone())
                .collect(),
            outputs: Value::Object(self.completed_outputs()),
            error: self
                .outcome_error
                .clone()
                .or_else(|| self.failing.clone()),
        }
    }

    // =========================================================================
    // Event fold
    // =========================================================================

    pub fn apply(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::ExecutionStarted { inputs, trigger } => {
                self.started = true;
                self.inputs = inputs.clone();
                self.trigger = trigger.clone();
            }

            ExecutionEvent::NodeStarted { node, attempt } => {
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::Running;
                    state.attempt = *attempt;
                }
            }

            ExecutionEvent::NodeCompleted { node, output } => {
                let is_conditional = self
                    .definition
                    .node(node)
                    .is_some_and(|n| n.node_type == node_types::CONDITIONAL);
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::Succeeded;
                    state.output = Some(output.clone());
                    if is_conditional {
                        state.selected_handle = output
                            .get("handle")
                            .and_then(|h| h.as_str())
                            .map(str::to_string);
                    }
                }
            }

            ExecutionEvent::NodeFailed {
                node,
                error,
                will_retry,
            } => self.apply_node_failed(node, error, *will_retry),

            ExecutionEvent::NodeSkipped { node, .. } => {
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::Skipped;
                }
            }

            ExecutionEvent::TimerStarted { node, fire_at, .. } => {
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::Sleeping;
                    state.fire_at = Some(*fire_at);
                }
            }

            ExecutionEvent::TimerFired { node } => {
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::Succeeded;
                    state.output = Some(Value::Null);
                }
            }

            ExecutionEvent::InputRequested { node } => {
                if let Some(state) = self.nodes.get_mut(node) {
                    state.phase = NodePhase::AwaitingInput;
                }
            }

            ExecutionEvent::SignalReceived { id, signal } => {
                if *id <= self.last_signal_id {
                    return;
                }
                self.last_signal_id = *id;
                match signal {
                    ExecutionSignal::Cancel { reason } => {
                        if self.cancelled.is_none() {
                            self.cancelled = Some(reason.clone());
                        }
                    }
                    ExecutionSignal::UserInput { node, payload } => {
                        if let Some(state) = self.nodes.get_mut(node) {
                            if state.phase == NodePhase::AwaitingInput {
                                state.phase = NodePhase::Succeeded;
                                state.output = Some(payload.clone());
                            }
                        }
                    }
                }
            }

            ExecutionEvent::ExecutionCompleted { .. } => {
                self.outcome = Some(ExecutionStatus::Completed);
            }
            ExecutionEvent::ExecutionFailed { error } => {
                self.outcome = Some(ExecutionStatus::Failed);
                self.outcome_error = Some(error.clone());
            }
            ExecutionEvent::ExecutionCancelled { .. } => {
                self.outcome = Some(ExecutionStatus::Cancelled);
            }
        }
    }

    /// Final failures run through the node's `onError` policy; retried
    /// failures just park the node in backoff.
    fn apply_node_failed(&mut self, node: &str, error: &NodeError, will_retry: bool) {
        let policy = match self.definition.node(node) {
            Some(def) => def.error_policy(),
            None => return,
        };

        let Some(state) = self.nodes.get_mut(node) else {
            return;
        };
        state.error = Some(error.clone());

        if will_retry {
            state.phase = NodePhase::Backoff;
            return;
        }

        match policy.strategy {
            ErrorStrategy::Continue => {
                state.phase = NodePhase::Succeeded;
                state.output = Some(Value::Null);
            }
            ErrorStrategy::Fallback => {
                state.phase = NodePhase::Succeeded;
                state.output = Some(policy.fallback_value.unwrap_or(Value::Null));
            }
            ErrorStrategy::Goto => {
                state.phase = NodePhase::Failed;
                if let Some(target) = policy.goto_node {
                    if self
                        .nodes
                        .get(&target)
                        .is_some_and(|s| s.phase == NodePhase::Pending)
                    {
                        self.forced_ready.insert(target);
                    }
                }
            }
            ErrorStrategy::Fail => {
                state.phase = NodePhase::Failed;
                if self.failing.is_none() {
                    self.failing = Some(ExecutionError::from_node(node, error));
                }
            }
        }
    }

    // =========================================================================
    // Action selection
    // =========================================================================

    /// Propose the next batch of actions, honoring the concurrency cap.
    ///
    /// The runner must persist-and-fold the event implied by each action
    /// before asking again; the selection here assumes exactly that
    /// discipline (a returned node stays `Pending` until its `NodeStarted`
    /// or equivalent event folds back).
    pub fn next_actions(&self) -> Vec<EngineAction> {
        if self.outcome.is_some() {
            return vec![];
        }

        let in_flight = self.in_flight_count();

        if let Some(reason) = &self.cancelled {
            if in_flight == 0 {
                return vec![EngineAction::CancelExecution {
                    reason: reason.clone(),
                }];
            }
            return vec![];
        }

        if let Some(error) = &self.failing {
            if in_flight == 0 {
                return vec![EngineAction::FailExecution {
                    error: error.clone(),
                }];
            }
            return vec![];
        }

        // Prune first: nodes whose every inbound edge resolved without one
        // satisfying. Skips cascade, so they are returned alone and the
        // runner folds them before the next selection round.
        let skips: Vec<EngineAction> = self
            .nodes
            .iter()
            .filter(|(name, state)| {
                state.phase == NodePhase::Pending && self.is_pruned(name)
            })
            .map(|(name, _)| EngineAction::SkipNode {
                node: name.clone(),
                reason: "no inbound edge satisfied".to_string(),
            })
            .collect();
        if !skips.is_empty() {
            return skips;
        }

        let ready = self.ready_nodes();
        if !ready.is_empty() {
            let budget = match self.definition.max_concurrent_nodes() {
                Some(cap) => cap.saturating_sub(in_flight),
                None => usize::MAX,
            };
            return ready
                .into_iter()
                .take(budget)
                .map(|node| {
                    let attempt = self
                        .nodes
                        .get(&node)
                        .map(|s| s.attempt + 1)
                        .unwrap_or(1);
                    EngineAction::DispatchNode { node, attempt }
                })
                .collect();
        }

        if in_flight == 0 && self.waiting_count() == 0 {
            if self.nodes.values().all(NodeState::settled) {
                return vec![EngineAction::CompleteExecution {
                    outputs: Value::Object(self.completed_outputs()),
                }];
            }
            // Unsettled nodes remain but nothing can make progress. The
            // graph is validated acyclic, so this is a dependency-tracking
            // bug surfacing, not a user error.
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .filter(|(_, s)| s.phase == NodePhase::Pending)
                .map(|(n, _)| n.as_str())
                .collect();
            return vec![EngineAction::FailExecution {
                error: ExecutionError::deadlock(format!(
                    "no dispatchable node among: {}",
                    stuck.join(", ")
                )),
            }];
        }

        vec![]
    }

    /// Pending nodes whose dependencies are satisfied, in name order.
    pub fn ready_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(name, state)| {
                state.phase == NodePhase::Pending && self.is_ready(name)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn is_ready(&self, name: &str) -> bool {
        if self.forced_ready.contains(name) {
            return true;
        }
        if name == self.definition.entry_point {
            return true;
        }

        let mut satisfied = 0usize;
        for edge in self.definition.inbound_edges(name) {
            match self.edge_state(edge) {
                EdgeState::Unresolved => return false,
                EdgeState::Satisfied => satisfied += 1,
                EdgeState::Pruned => {}
            }
        }
        satisfied > 0
    }

    /// All inbound edges resolved, none satisfied: the node can never run.
    /// A non-entry node with no inbound edges at all is unreachable and
    /// prunes immediately.
    fn is_pruned(&self, name: &str) -> bool {
        if self.forced_ready.contains(name) || name == self.definition.entry_point {
            return false;
        }

        for edge in self.definition.inbound_edges(name) {
            match self.edge_state(edge) {
                EdgeState::Unresolved => return false,
                EdgeState::Satisfied => return false,
                EdgeState::Pruned => {}
            }
        }
        // No unresolved or satisfied edge remains (or none existed).
        true
    }

    fn edge_state(&self, edge: &flowmaestro_core::EdgeDefinition) -> EdgeState {
        let Some(source) = self.nodes.get(&edge.source) else {
            return EdgeState::Pruned;
        };
        match source.phase {
            NodePhase::Succeeded => {
                if let Some(handle) = &edge.source_handle {
                    if let Some(selected) = &source.selected_handle {
                        if handle != selected {
                            return EdgeState::Pruned;
                        }
                    }
                }
                EdgeState::Satisfied
            }
            NodePhase::Skipped | NodePhase::Failed => EdgeState::Pruned,
            _ => EdgeState::Unresolved,
        }
    }

    fn in_flight_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|s| s.phase == NodePhase::Running || s.phase == NodePhase::Backoff)
            .count()
    }

    fn waiting_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|s| {
                s.phase == NodePhase::Sleeping || s.phase == NodePhase::AwaitingInput
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmaestro_core::{
        EdgeDefinition, ErrorKind, NodeDefinition, OnErrorPolicy, Position,
    };
    use serde_json::json;

    fn node(name: &str, node_type: &str) -> NodeDefinition {
        NodeDefinition {
            node_type: node_type.to_string(),
            name: name.to_string(),
            config: json!({}),
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

    fn handle_edge(id: &str, source: &str, target: &str, handle: &str) -> EdgeDefinition {
        EdgeDefinition {
            source_handle: Some(handle.to_string()),
            ..edge(id, source, target)
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

    fn start(machine: &mut GraphMachine) {
        machine.apply(&ExecutionEvent::ExecutionStarted {
            inputs: json!({}),
            trigger: None,
        });
    }

    fn dispatch_names(actions: &[EngineAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                EngineAction::DispatchNode { node, .. } => Some(node.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_linear_progression() {
        let def = definition(
            vec![node("a", node_types::HTTP), node("b", node_types::TRANSFORM)],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);

        let actions = machine.next_actions();
        assert_eq!(dispatch_names(&actions), vec!["a"]);

        machine.apply(&ExecutionEvent::NodeStarted {
            node: "a".to_string(),
            attempt: 1,
        });
        assert!(machine.next_actions().is_empty());

        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "a".to_string(),
            output: json!({"data": 1}),
        });
        let actions = machine.next_actions();
        assert_eq!(dispatch_names(&actions), vec!["b"]);

        machine.apply(&ExecutionEvent::NodeStarted {
            node: "b".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "b".to_string(),
            output: json!({"out": 2}),
        });

        let actions = machine.next_actions();
        match &actions[0] {
            EngineAction::CompleteExecution { outputs } => {
                assert_eq!(outputs["a"]["data"], 1);
                assert_eq!(outputs["b"]["out"], 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_node_inputs_are_satisfied_predecessor_outputs() {
        let def = definition(
            vec![node("a", node_types::HTTP), node("b", node_types::TRANSFORM)],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "a".to_string(),
            output: json!({"data": "x"}),
        });

        let inputs = machine.node_inputs("b");
        assert_eq!(inputs["a"]["data"], "x");
    }

    #[test]
    fn test_conditional_prunes_unselected_branch() {
        let def = definition(
            vec![
                node("c1", node_types::CONDITIONAL),
                node("api", node_types::HTTP),
                node("db", node_types::DATABASE_QUERY),
            ],
            vec![
                handle_edge("e1", "c1", "api", "true"),
                handle_edge("e2", "c1", "db", "false"),
            ],
            "c1",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "c1".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "c1".to_string(),
            output: json!({"handle": "true", "value": true}),
        });

        // db's only inbound edge is pruned, so it gets skipped; api runs.
        let actions = machine.next_actions();
        assert_eq!(
            actions,
            vec![EngineAction::SkipNode {
                node: "db".to_string(),
                reason: "no inbound edge satisfied".to_string(),
            }]
        );
        machine.apply(&ExecutionEvent::NodeSkipped {
            node: "db".to_string(),
            reason: "no inbound edge satisfied".to_string(),
        });

        let actions = machine.next_actions();
        assert_eq!(dispatch_names(&actions), vec!["api"]);
    }

    #[test]
    fn test_skip_cascades_downstream() {
        let def = definition(
            vec![
                node("c1", node_types::CONDITIONAL),
                node("a", node_types::HTTP),
                node("b", node_types::TRANSFORM),
            ],
            vec![
                handle_edge("e1", "c1", "a", "false"),
                edge("e2", "a", "b"),
            ],
            "c1",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "c1".to_string(),
            output: json!({"handle": "true", "value": true}),
        });

        machine.apply(&ExecutionEvent::NodeSkipped {
            node: "a".to_string(),
            reason: "no inbound edge satisfied".to_string(),
        });
        let actions = machine.next_actions();
        assert_eq!(
            actions,
            vec![EngineAction::SkipNode {
                node: "b".to_string(),
                reason: "no inbound edge satisfied".to_string(),
            }]
        );
        machine.apply(&ExecutionEvent::NodeSkipped {
            node: "b".to_string(),
            reason: "no inbound edge satisfied".to_string(),
        });

        // Everything settled: c1 succeeded, a and b skipped.
        let actions = machine.next_actions();
        assert!(matches!(
            actions[0],
            EngineAction::CompleteExecution { .. }
        ));
    }

    #[test]
    fn test_concurrency_cap_limits_dispatch() {
        let mut def = definition(
            vec![
                node("root", node_types::HTTP),
                node("x", node_types::HTTP),
                node("y", node_types::HTTP),
                node("z", node_types::HTTP),
            ],
            vec![
                edge("e1", "root", "x"),
                edge("e2", "root", "y"),
                edge("e3", "root", "z"),
            ],
            "root",
        );
        def.settings = Some(flowmaestro_core::WorkflowSettings {
            timeout: None,
            max_concurrent_nodes: Some(2),
            enable_cache: None,
        });

        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "root".to_string(),
            output: json!(null),
        });

        let actions = machine.next_actions();
        assert_eq!(dispatch_names(&actions).len(), 2);

        // With both slots occupied nothing more dispatches.
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "x".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "y".to_string(),
            attempt: 1,
        });
        assert!(machine.next_actions().is_empty());

        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "x".to_string(),
            output: json!(null),
        });
        let actions = machine.next_actions();
        assert_eq!(dispatch_names(&actions), vec!["z"]);
    }

    #[test]
    fn test_fail_policy_propagates() {
        let def = definition(
            vec![node("a", node_types::HTTP), node("b", node_types::TRANSFORM)],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "a".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::permanent(ErrorKind::Server, "boom"),
            will_retry: false,
        });

        let actions = machine.next_actions();
        match &actions[0] {
            EngineAction::FailExecution { error } => {
                assert_eq!(error.kind, ErrorKind::Server);
                assert_eq!(error.failed_node.as_deref(), Some("a"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_continue_policy_yields_null_output() {
        let mut n = node("a", node_types::HTTP);
        n.on_error = Some(OnErrorPolicy {
            strategy: ErrorStrategy::Continue,
            fallback_value: None,
            goto_node: None,
        });
        let def = definition(
            vec![n, node("b", node_types::TRANSFORM)],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::permanent(ErrorKind::Server, "boom"),
            will_retry: false,
        });

        assert_eq!(machine.node_state("a").unwrap().phase, NodePhase::Succeeded);
        assert_eq!(machine.node_state("a").unwrap().output, Some(json!(null)));
        assert_eq!(dispatch_names(&machine.next_actions()), vec!["b"]);
    }

    #[test]
    fn test_fallback_policy_substitutes_value() {
        let mut n = node("a", node_types::HTTP);
        n.on_error = Some(OnErrorPolicy {
            strategy: ErrorStrategy::Fallback,
            fallback_value: Some(json!({"ok": false})),
            goto_node: None,
        });
        let def = definition(vec![n], vec![], "a");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::permanent(ErrorKind::Server, "boom"),
            will_retry: false,
        });

        assert_eq!(
            machine.node_state("a").unwrap().output,
            Some(json!({"ok": false}))
        );
        let actions = machine.next_actions();
        match &actions[0] {
            EngineAction::CompleteExecution { outputs } => {
                assert_eq!(outputs["a"]["ok"], false);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_goto_policy_jumps_and_prunes_successors() {
        let mut n = node("a", node_types::HTTP);
        n.on_error = Some(OnErrorPolicy {
            strategy: ErrorStrategy::Goto,
            fallback_value: None,
            goto_node: Some("recover".to_string()),
        });
        let def = definition(
            vec![
                n,
                node("b", node_types::TRANSFORM),
                node("recover", node_types::TRANSFORM),
            ],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::permanent(ErrorKind::Server, "boom"),
            will_retry: false,
        });

        // Normal successor b is pruned; recover is forced ready.
        let actions = machine.next_actions();
        assert_eq!(
            actions,
            vec![EngineAction::SkipNode {
                node: "b".to_string(),
                reason: "no inbound edge satisfied".to_string(),
            }]
        );
        machine.apply(&ExecutionEvent::NodeSkipped {
            node: "b".to_string(),
            reason: "no inbound edge satisfied".to_string(),
        });
        assert_eq!(dispatch_names(&machine.next_actions()), vec!["recover"]);
    }

    #[test]
    fn test_retry_parks_in_backoff() {
        let def = definition(vec![node("a", node_types::HTTP)], vec![], "a");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "a".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::retryable(ErrorKind::Server, "upstream 500"),
            will_retry: true,
        });

        assert_eq!(machine.node_state("a").unwrap().phase, NodePhase::Backoff);
        // Backoff nodes are runner-owned; the machine proposes nothing.
        assert!(machine.next_actions().is_empty());
        assert_eq!(machine.backoff_nodes(), vec![("a".to_string(), 1)]);

        machine.apply(&ExecutionEvent::NodeStarted {
            node: "a".to_string(),
            attempt: 2,
        });
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "a".to_string(),
            output: json!("ok"),
        });
        assert!(matches!(
            machine.next_actions()[0],
            EngineAction::CompleteExecution { .. }
        ));
    }

    #[test]
    fn test_user_input_round_trip() {
        let def = definition(
            vec![
                node("ask", node_types::USER_INPUT),
                node("echo", node_types::TRANSFORM),
            ],
            vec![edge("e1", "ask", "echo")],
            "ask",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::InputRequested {
            node: "ask".to_string(),
        });

        assert_eq!(machine.status(), ExecutionStatus::WaitingForInput);
        assert!(machine.next_actions().is_empty());

        machine.apply(&ExecutionEvent::SignalReceived {
            id: 1,
            signal: ExecutionSignal::user_input("ask", json!("hello")),
        });
        assert_eq!(machine.status(), ExecutionStatus::Running);
        assert_eq!(machine.node_state("ask").unwrap().output, Some(json!("hello")));
        assert_eq!(dispatch_names(&machine.next_actions()), vec!["echo"]);
    }

    #[test]
    fn test_signal_dedup_by_id() {
        let def = definition(vec![node("ask", node_types::USER_INPUT)], vec![], "ask");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::InputRequested {
            node: "ask".to_string(),
        });

        machine.apply(&ExecutionEvent::SignalReceived {
            id: 3,
            signal: ExecutionSignal::user_input("ask", json!("first")),
        });
        // A replayed delivery with the same id must not overwrite.
        machine.apply(&ExecutionEvent::SignalReceived {
            id: 3,
            signal: ExecutionSignal::user_input("ask", json!("second")),
        });

        assert_eq!(machine.node_state("ask").unwrap().output, Some(json!("first")));
        assert_eq!(machine.last_signal_id(), 3);
    }

    #[test]
    fn test_cancel_during_sleep() {
        let def = definition(vec![node("wait", node_types::DELAY)], vec![], "wait");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::TimerStarted {
            node: "wait".to_string(),
            duration_ms: 60_000,
            fire_at: Utc::now() + chrono::Duration::seconds(60),
        });

        machine.apply(&ExecutionEvent::SignalReceived {
            id: 1,
            signal: ExecutionSignal::cancel("user requested"),
        });

        let actions = machine.next_actions();
        assert_eq!(
            actions,
            vec![EngineAction::CancelExecution {
                reason: "user requested".to_string(),
            }]
        );
        machine.apply(&ExecutionEvent::ExecutionCancelled {
            reason: "user requested".to_string(),
        });
        assert_eq!(machine.status(), ExecutionStatus::Cancelled);
        assert!(machine.next_actions().is_empty());
    }

    #[test]
    fn test_cancel_waits_for_in_flight_nodes() {
        let def = definition(vec![node("a", node_types::HTTP)], vec![], "a");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeStarted {
            node: "a".to_string(),
            attempt: 1,
        });
        machine.apply(&ExecutionEvent::SignalReceived {
            id: 1,
            signal: ExecutionSignal::cancel("stop"),
        });

        // The running node must be allowed to observe the signal first.
        assert!(machine.next_actions().is_empty());

        machine.apply(&ExecutionEvent::NodeFailed {
            node: "a".to_string(),
            error: NodeError::cancelled(),
            will_retry: false,
        });
        assert_eq!(
            machine.next_actions(),
            vec![EngineAction::CancelExecution {
                reason: "stop".to_string(),
            }]
        );
    }

    #[test]
    fn test_deadlock_detection() {
        // Bypasses validation on purpose: c and d depend on each other, so
        // after the entry settles nothing can dispatch.
        let def = definition(
            vec![
                node("entry", node_types::HTTP),
                node("c", node_types::HTTP),
                node("d", node_types::HTTP),
            ],
            vec![edge("e1", "c", "d"), edge("e2", "d", "c")],
            "entry",
        );
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::NodeCompleted {
            node: "entry".to_string(),
            output: json!(null),
        });

        let actions = machine.next_actions();
        match &actions[0] {
            EngineAction::FailExecution { error } => {
                assert_eq!(error.kind, ErrorKind::Deadlock);
            }
            other => panic!("expected deadlock failure, got {other:?}"),
        }
    }

    #[test]
    fn test_replay_reconstructs_identical_state() {
        let def = definition(
            vec![node("a", node_types::HTTP), node("b", node_types::TRANSFORM)],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let events = vec![
            ExecutionEvent::ExecutionStarted {
                inputs: json!({"k": 1}),
                trigger: None,
            },
            ExecutionEvent::NodeStarted {
                node: "a".to_string(),
                attempt: 1,
            },
            ExecutionEvent::NodeCompleted {
                node: "a".to_string(),
                output: json!({"data": 9}),
            },
            ExecutionEvent::NodeStarted {
                node: "b".to_string(),
                attempt: 1,
            },
        ];

        let machine = GraphMachine::replay(def.clone(), events.iter());

        assert_eq!(machine.status(), ExecutionStatus::Running);
        assert_eq!(machine.node_state("a").unwrap().phase, NodePhase::Succeeded);
        assert_eq!(machine.running_nodes(), vec![("b".to_string(), 1)]);
        assert_eq!(machine.inputs()["k"], 1);

        // Replaying the same history twice gives the same proposals.
        let again = GraphMachine::replay(def, events.iter());
        assert_eq!(machine.next_actions(), again.next_actions());
    }

    #[test]
    fn test_snapshot_reports_waiting_node() {
        let def = definition(vec![node("ask", node_types::USER_INPUT)], vec![], "ask");
        let mut machine = GraphMachine::new(def);
        start(&mut machine);
        machine.apply(&ExecutionEvent::InputRequested {
            node: "ask".to_string(),
        });

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.status, ExecutionStatus::WaitingForInput);
        assert_eq!(snapshot.waiting_on, vec!["ask".to_string()]);
    }
}
