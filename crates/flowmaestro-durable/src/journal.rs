//! Journal and status seams
//!
//! The engine records two kinds of durable side effects beyond its event
//! history: per-execution log entries (the journal) and the execution row's
//! status. Both live behind traits so the engine crate stays storage-free;
//! the storage crate implements them on its `Database`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use flowmaestro_core::{ExecutionError, LogLevel};

use crate::store::ExecutionStatus;

/// One append-only log entry. The store assigns the per-execution sequence
/// number; `dedupe` makes engine-generated entries idempotent under replay
/// (an entry with a dedupe key already present is dropped silently).
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub execution_id: Uuid,

    /// Node name, or `None` for entries from the engine itself (surfaced as
    /// `_engine` to readers).
    pub node: Option<String>,

    pub level: LogLevel,
    pub message: String,
    pub payload: Option<Value>,
    pub at: DateTime<Utc>,

    pub dedupe: Option<String>,
}

impl JournalEntry {
    pub fn engine(execution_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            node: None,
            level,
            message: message.into(),
            payload: None,
            at: Utc::now(),
            dedupe: None,
        }
    }

    pub fn node(
        execution_id: Uuid,
        node: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node: Some(node.into()),
            ..Self::engine(execution_id, level, message)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Key engine transitions on the event sequence that produced them.
    pub fn with_dedupe(mut self, key: impl Into<String>) -> Self {
        self.dedupe = Some(key.into());
        self
    }
}

#[async_trait]
pub trait Journal: Send + Sync + 'static {
    async fn append(&self, entry: JournalEntry) -> anyhow::Result<()>;
}

/// Mirror of the execution row the API reads.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub outputs: Option<Value>,
    pub error: Option<ExecutionError>,
}

#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    async fn update(&self, update: StatusUpdate) -> anyhow::Result<()>;
}

/// Discards everything; for tests that only exercise engine semantics.
#[derive(Default)]
pub struct NullJournal;

#[async_trait]
impl Journal for NullJournal {
    async fn append(&self, _entry: JournalEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NullStatusSink;

#[async_trait]
impl StatusSink for NullStatusSink {
    async fn update(&self, _update: StatusUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}
