//! PostgreSQL implementation of ExecutionEventStore
//!
//! Histories live in `flowmaestro.execution_events` keyed by
//! `(execution_id, seq)`; the primary key is what enforces the optimistic
//! append. Signals live in `flowmaestro.execution_signals` with a
//! per-execution monotonic id assigned inside the insert transaction.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::event::ExecutionEvent;
use crate::signal::{ExecutionSignal, SignalEnvelope};
use crate::store::{ExecutionEventStore, StoreError};

pub struct PostgresExecutionEventStore {
    pool: PgPool,
}

impl PostgresExecutionEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[async_trait]
impl ExecutionEventStore for PostgresExecutionEventStore {
    async fn create_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        // Histories are implicit: the first append creates them. Nothing to
        // do here beyond verifying connectivity cheaply.
        let _ = execution_id;
        Ok(())
    }

    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_seq: i64,
        events: Vec<ExecutionEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize appends per execution for the duration of the
        // transaction; the (execution_id, seq) primary key is the backstop.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(seq) + 1, 0) AS next_seq
            FROM flowmaestro.execution_events
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await?;
        let actual: i64 = row.get("next_seq");

        if actual != expected_seq {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_seq,
                actual,
            });
        }

        let mut seq = expected_seq;
        for event in &events {
            let payload = serde_json::to_value(event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO flowmaestro.execution_events (execution_id, seq, event)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(execution_id)
            .bind(seq)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
            seq += 1;
        }

        tx.commit().await?;
        Ok(seq)
    }

    async fn load_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<(i64, ExecutionEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, event
            FROM flowmaestro.execution_events
            WHERE execution_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let payload: serde_json::Value = row.get("event");
                let event = serde_json::from_value(payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok((seq, event))
            })
            .collect()
    }

    async fn send_signal(
        &self,
        execution_id: Uuid,
        signal: ExecutionSignal,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(&signal)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 1))")
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO flowmaestro.execution_signals (execution_id, id, signal)
            SELECT $1,
                   COALESCE((SELECT MAX(id) FROM flowmaestro.execution_signals
                             WHERE execution_id = $1), 0) + 1,
                   $2
            RETURNING id
            "#,
        )
        .bind(execution_id)
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.get("id");

        tx.commit().await?;
        Ok(id)
    }

    async fn pending_signals(
        &self,
        execution_id: Uuid,
        after_id: i64,
    ) -> Result<Vec<SignalEnvelope>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, signal, sent_at
            FROM flowmaestro.execution_signals
            WHERE execution_id = $1 AND id > $2
            ORDER BY id ASC
            "#,
        )
        .bind(execution_id)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let signal: serde_json::Value = row.get("signal");
                Ok(SignalEnvelope {
                    id: row.get("id"),
                    signal: serde_json::from_value(signal)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    sent_at: row.get("sent_at"),
                })
            })
            .collect()
    }

    async fn unfinished_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id
            FROM flowmaestro.execution_events
            GROUP BY execution_id
            HAVING COUNT(*) FILTER (
                WHERE event->>'type' IN
                    ('execution_completed', 'execution_failed', 'execution_cancelled')
            ) = 0
            ORDER BY execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("execution_id")).collect())
    }
}
