//! Engine seams backed by the database
//!
//! The engine writes its journal entries and status mirror through these
//! trait impls; both land in the same store the API reads.

use async_trait::async_trait;

use flowmaestro_durable::{Journal, JournalEntry, StatusSink, StatusUpdate};

use crate::repositories::Database;

#[async_trait]
impl Journal for Database {
    async fn append(&self, entry: JournalEntry) -> anyhow::Result<()> {
        self.append_log(
            entry.execution_id,
            entry.node.as_deref(),
            entry.level.as_str(),
            &entry.message,
            entry.payload.as_ref(),
            entry.dedupe.as_deref(),
            entry.at,
        )
        .await
    }
}

#[async_trait]
impl StatusSink for Database {
    async fn update(&self, update: StatusUpdate) -> anyhow::Result<()> {
        let failed_node = update
            .error
            .as_ref()
            .and_then(|e| e.failed_node.clone());
        let error = update
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        self.update_execution_status(
            update.execution_id,
            update.status.as_str(),
            update.outputs,
            error,
            failed_node,
        )
        .await
    }
}
