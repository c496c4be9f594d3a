//! Execution events for persistence
//!
//! These events form the append-only log for an execution. They are used
//! for persisting progress, replaying executions after recovery, and
//! auditing. Events are immutable once written; execution state is
//! reconstructed by folding them in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowmaestro_core::{ExecutionError, NodeError};

use crate::signal::ExecutionSignal;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    // =========================================================================
    // Execution Lifecycle
    // =========================================================================
    /// Execution was started with the given inputs.
    ExecutionStarted {
        inputs: serde_json::Value,

        /// Payload of the trigger that launched the execution, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<serde_json::Value>,
    },

    /// Execution finished; `outputs` is the union of node outputs.
    ExecutionCompleted { outputs: serde_json::Value },

    /// Execution failed terminally.
    ExecutionFailed { error: ExecutionError },

    /// Execution was cancelled via signal.
    ExecutionCancelled { reason: String },

    // =========================================================================
    // Node Lifecycle
    // =========================================================================
    /// A node dispatch began (attempt is 1-based).
    NodeStarted { node: String, attempt: u32 },

    /// A node produced its output.
    NodeCompleted {
        node: String,
        output: serde_json::Value,
    },

    /// A node attempt failed. When `will_retry` is true the engine re-enters
    /// the node after backoff; otherwise the node's `onError` policy applies.
    NodeFailed {
        node: String,
        error: NodeError,
        will_retry: bool,
    },

    /// A node was pruned: none of its inbound edges were satisfied.
    NodeSkipped { node: String, reason: String },

    // =========================================================================
    // Suspension Points
    // =========================================================================
    /// A `delay` node parked the execution. `fire_at` is recorded so replay
    /// resumes with the remaining duration rather than restarting the wait.
    TimerStarted {
        node: String,
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    },

    /// The delay elapsed.
    TimerFired { node: String },

    /// A `user-input` node parked the execution pending a signal.
    InputRequested { node: String },

    // =========================================================================
    // Signals
    // =========================================================================
    /// An external signal was observed. `id` is the store-assigned monotonic
    /// signal id; replays deduplicate on it.
    SignalReceived { id: i64, signal: ExecutionSignal },
}

impl ExecutionEvent {
    /// The node this event concerns, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeSkipped { node, .. }
            | Self::TimerStarted { node, .. }
            | Self::TimerFired { node }
            | Self::InputRequested { node } => Some(node),
            _ => None,
        }
    }

    /// Whether this event ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
        )
    }

    /// Name used when publishing this event to live subscribers; `None` for
    /// events that are internal bookkeeping only.
    pub fn fanout_name(&self) -> Option<&'static str> {
        match self {
            Self::ExecutionStarted { .. } => Some("execution.started"),
            Self::ExecutionCompleted { .. } => Some("execution.completed"),
            Self::ExecutionFailed { .. } => Some("execution.failed"),
            Self::ExecutionCancelled { .. } => Some("execution.cancelled"),
            Self::NodeStarted { .. } => Some("node.started"),
            Self::NodeCompleted { .. } | Self::TimerFired { .. } => Some("node.completed"),
            Self::NodeFailed { .. } => Some("node.failed"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmaestro_core::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = ExecutionEvent::ExecutionStarted {
            inputs: json!({"source": "api"}),
            trigger: None,
        };

        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"type\":\"execution_started\""));

        let parsed: ExecutionEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_node_extraction() {
        let event = ExecutionEvent::NodeStarted {
            node: "fetch".to_string(),
            attempt: 1,
        };
        assert_eq!(event.node(), Some("fetch"));

        let event = ExecutionEvent::ExecutionCompleted { outputs: json!({}) };
        assert_eq!(event.node(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(ExecutionEvent::ExecutionCompleted { outputs: json!({}) }.is_terminal());
        assert!(ExecutionEvent::ExecutionFailed {
            error: ExecutionError::new(ErrorKind::Server, "boom"),
        }
        .is_terminal());
        assert!(ExecutionEvent::ExecutionCancelled {
            reason: "user".to_string(),
        }
        .is_terminal());

        assert!(!ExecutionEvent::NodeCompleted {
            node: "n".to_string(),
            output: json!(null),
        }
        .is_terminal());
    }

    #[test]
    fn test_failed_event_round_trip() {
        let event = ExecutionEvent::NodeFailed {
            node: "fetch".to_string(),
            error: NodeError::retryable(ErrorKind::Server, "upstream 500"),
            will_retry: true,
        };

        let raw = serde_json::to_string(&event).unwrap();
        let parsed: ExecutionEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, parsed);
    }
}
