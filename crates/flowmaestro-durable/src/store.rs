//! ExecutionEventStore trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ExecutionEvent;
use crate::signal::{ExecutionSignal, SignalEnvelope};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Optimistic append lost the race.
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Execution status as persisted and surfaced by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    WaitingForInput,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::WaitingForInput => "waiting_for_input",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "waiting_for_input" => Ok(Self::WaitingForInput),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Store for execution event histories and signal queues.
///
/// Implementations must be thread-safe. Appends use optimistic concurrency:
/// the caller states the sequence it believes is next, and the store rejects
/// the batch if another writer got there first.
#[async_trait]
pub trait ExecutionEventStore: Send + Sync + 'static {
    /// Register an execution so events can be appended to it.
    async fn create_execution(&self, execution_id: Uuid) -> Result<(), StoreError>;

    /// Append events; `expected_seq` is the sequence the first new event
    /// should receive. Returns the next expected sequence after the batch.
    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_seq: i64,
        events: Vec<ExecutionEvent>,
    ) -> Result<i64, StoreError>;

    /// Load the full history in sequence order.
    async fn load_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(i64, ExecutionEvent)>, StoreError>;

    /// Enqueue a signal, assigning it the next monotonic id for the
    /// execution. Delivery to the engine is at-least-once.
    async fn send_signal(
        &self,
        execution_id: Uuid,
        signal: ExecutionSignal,
    ) -> Result<i64, StoreError>;

    /// Signals with ids greater than `after_id`, in id order.
    async fn pending_signals(
        &self,
        execution_id: Uuid,
        after_id: i64,
    ) -> Result<Vec<SignalEnvelope>, StoreError>;

    /// Executions whose histories have no terminal event; recovery re-drives
    /// these after a restart.
    async fn unfinished_executions(&self) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
impl<T: ExecutionEventStore> ExecutionEventStore for std::sync::Arc<T> {
    async fn create_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        (**self).create_execution(execution_id).await
    }

    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_seq: i64,
        events: Vec<ExecutionEvent>,
    ) -> Result<i64, StoreError> {
        (**self).append_events(execution_id, expected_seq, events).await
    }

    async fn load_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(i64, ExecutionEvent)>, StoreError> {
        (**self).load_events(execution_id).await
    }

    async fn send_signal(
        &self,
        execution_id: Uuid,
        signal: ExecutionSignal,
    ) -> Result<i64, StoreError> {
        (**self).send_signal(execution_id, signal).await
    }

    async fn pending_signals(
        &self,
        execution_id: Uuid,
        after_id: i64,
    ) -> Result<Vec<SignalEnvelope>, StoreError> {
        (**self).pending_signals(execution_id, after_id).await
    }

    async fn unfinished_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        (**self).unfinished_executions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::WaitingForInput,
        ] {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::WaitingForInput.is_terminal());
    }
}
