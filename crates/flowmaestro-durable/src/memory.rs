//! In-memory implementation of ExecutionEventStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::event::ExecutionEvent;
use crate::signal::{ExecutionSignal, SignalEnvelope};
use crate::store::{ExecutionEventStore, StoreError};

struct ExecutionState {
    events: Vec<ExecutionEvent>,
    signals: Vec<SignalEnvelope>,
    next_signal_id: i64,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            signals: Vec::new(),
            next_signal_id: 1,
        }
    }
}

/// In-memory implementation of [`ExecutionEventStore`].
///
/// Primarily for tests; provides the same optimistic-append semantics as the
/// PostgreSQL implementation.
#[derive(Default)]
pub struct InMemoryExecutionEventStore {
    executions: RwLock<HashMap<Uuid, ExecutionState>>,
}

impl InMemoryExecutionEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Event count for one execution (testing helper).
    pub fn event_count(&self, execution_id: Uuid) -> usize {
        self.executions
            .read()
            .get(&execution_id)
            .map(|e| e.events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ExecutionEventStore for InMemoryExecutionEventStore {
    async fn create_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        self.executions
            .write()
            .entry(execution_id)
            .or_insert_with(ExecutionState::new);
        Ok(())
    }

    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_seq: i64,
        events: Vec<ExecutionEvent>,
    ) -> Result<i64, StoreError> {
        let mut executions = self.executions.write();
        let state = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let actual = state.events.len() as i64;
        if actual != expected_seq {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_seq,
                actual,
            });
        }

        state.events.extend(events);
        Ok(state.events.len() as i64)
    }

    async fn load_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(i64, ExecutionEvent)>, StoreError> {
        let executions = self.executions.read();
        let state = executions
            .get(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        Ok(state
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i64, e.clone()))
            .collect())
    }

    async fn send_signal(
        &self,
        execution_id: Uuid,
        signal: ExecutionSignal,
    ) -> Result<i64, StoreError> {
        let mut executions = self.executions.write();
        let state = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let id = state.next_signal_id;
        state.next_signal_id += 1;
        state.signals.push(SignalEnvelope {
            id,
            signal,
            sent_at: Utc::now(),
        });
        Ok(id)
    }

    async fn pending_signals(
        &self,
        execution_id: Uuid,
        after_id: i64,
    ) -> Result<Vec<SignalEnvelope>, StoreError> {
        let executions = self.executions.read();
        let state = executions
            .get(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        Ok(state
            .signals
            .iter()
            .filter(|s| s.id > after_id)
            .cloned()
            .collect())
    }

    async fn unfinished_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let executions = self.executions.read();
        let mut ids: Vec<Uuid> = executions
            .iter()
            .filter(|(_, state)| !state.events.iter().any(ExecutionEvent::is_terminal))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started() -> ExecutionEvent {
        ExecutionEvent::ExecutionStarted {
            inputs: json!({}),
            trigger: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = InMemoryExecutionEventStore::new();
        let id = Uuid::now_v7();
        store.create_execution(id).await.unwrap();

        let next = store.append_events(id, 0, vec![started()]).await.unwrap();
        assert_eq!(next, 1);

        let events = store.load_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 0);
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = InMemoryExecutionEventStore::new();
        let id = Uuid::now_v7();
        store.create_execution(id).await.unwrap();
        store.append_events(id, 0, vec![started()]).await.unwrap();

        let err = store
            .append_events(id, 0, vec![started()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_signal_ids_are_monotonic() {
        let store = InMemoryExecutionEventStore::new();
        let id = Uuid::now_v7();
        store.create_execution(id).await.unwrap();

        let first = store
            .send_signal(id, ExecutionSignal::cancel("a"))
            .await
            .unwrap();
        let second = store
            .send_signal(id, ExecutionSignal::user_input("n", json!(1)))
            .await
            .unwrap();
        assert!(second > first);

        let pending = store.pending_signals(id, first).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }

    #[tokio::test]
    async fn test_unfinished_executions() {
        let store = InMemoryExecutionEventStore::new();
        let open = Uuid::now_v7();
        let done = Uuid::now_v7();
        store.create_execution(open).await.unwrap();
        store.create_execution(done).await.unwrap();

        store.append_events(open, 0, vec![started()]).await.unwrap();
        store
            .append_events(
                done,
                0,
                vec![
                    started(),
                    ExecutionEvent::ExecutionCompleted { outputs: json!({}) },
                ],
            )
            .await
            .unwrap();

        let unfinished = store.unfinished_executions().await.unwrap();
        assert_eq!(unfinished, vec![open]);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let store = InMemoryExecutionEventStore::new();
        let err = store.load_events(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionNotFound(_)));
    }
}
