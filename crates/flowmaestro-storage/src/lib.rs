//! # FlowMaestro Storage
//!
//! PostgreSQL persistence for the platform: workflows and their immutable
//! version snapshots, executions and their append-only logs, triggers,
//! webhook diagnostics, and encrypted connection records. The engine's
//! journal and status seams are implemented here on [`Database`], and the
//! schema (under the `flowmaestro` namespace) lives in `migrations/`.

pub mod encryption;
pub mod models;
pub mod repositories;
pub mod sinks;

pub use encryption::{EncryptedBlob, EncryptionService};
pub use repositories::Database;
