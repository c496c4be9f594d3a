//! Signals delivered into running executions
//!
//! Signals are at-least-once: callers may retry delivery, so the store
//! assigns each one a monotonically increasing id per execution and the
//! state machine ignores ids at or below the highest it has already folded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionSignal {
    /// Deliver a value to a named paused `user-input` node.
    UserInput {
        node: String,
        payload: serde_json::Value,
    },

    /// Request cooperative cancellation.
    Cancel { reason: String },
}

impl ExecutionSignal {
    pub fn user_input(node: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::UserInput {
            node: node.into(),
            payload,
        }
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel {
            reason: reason.into(),
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel { .. })
    }
}

/// A signal as stored: id assigned by the store, delivery-ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub id: i64,
    pub signal: ExecutionSignal,
    pub sent_at: DateTime<Utc>,
}
