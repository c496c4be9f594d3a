//! Actions the state machine asks the runner to perform
//!
//! [`crate::machine::GraphMachine::next_actions`] proposes these; the runner
//! records the corresponding event (which folds back into the machine) and
//! then performs the side effect. The machine itself never does I/O.

use serde_json::Value;

use flowmaestro_core::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Dispatch a ready node. The runner decides how, based on the node's
    /// type: registry executors run as tasks, `delay` starts a durable
    /// timer, `user-input` parks the execution, `loop` drives its body
    /// sub-graph.
    DispatchNode { node: String, attempt: u32 },

    /// Record that a node can never run because every inbound edge was
    /// pruned.
    SkipNode { node: String, reason: String },

    /// All nodes settled; finish with the union of node outputs.
    CompleteExecution { outputs: Value },

    /// A propagated failure (or deadlock) ends the execution.
    FailExecution { error: ExecutionError },

    /// A cancel signal was observed and nothing is left in flight.
    CancelExecution { reason: String },
}

impl EngineAction {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteExecution { .. }
                | Self::FailExecution { .. }
                | Self::CancelExecution { .. }
        )
    }
}
