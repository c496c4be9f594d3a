//! # Durable Execution Engine
//!
//! An event-sourced engine for workflow executions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │   (drive loop per execution: dispatch, retries, timers,     │
//! │    signals, cancellation, journal + fan-out effects)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      GraphMachine                           │
//! │   (pure fold of ExecutionEvents → node state → actions)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ExecutionEventStore                        │
//! │   (PostgreSQL: flowmaestro.execution_events / _signals;     │
//! │    in-memory twin for tests)                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state change is persisted as an [`ExecutionEvent`] before its side
//! effect runs. Replaying the log through [`GraphMachine::replay`] after a
//! crash reconstructs identical state, so restarts re-issue exactly the work
//! that was in flight and nothing else.

pub mod action;
pub mod event;
pub mod journal;
pub mod machine;
pub mod memory;
pub mod observer;
pub mod postgres;
pub mod retry;
pub mod runner;
pub mod signal;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::action::EngineAction;
    pub use crate::event::ExecutionEvent;
    pub use crate::journal::{Journal, JournalEntry, StatusSink, StatusUpdate};
    pub use crate::machine::{ExecutionSnapshot, GraphMachine, NodePhase};
    pub use crate::memory::InMemoryExecutionEventStore;
    pub use crate::observer::{EngineEvent, EngineObserver};
    pub use crate::postgres::PostgresExecutionEventStore;
    pub use crate::retry::RetryPolicy;
    pub use crate::runner::{Engine, EngineConfig, ExecutionParams};
    pub use crate::signal::{ExecutionSignal, SignalEnvelope};
    pub use crate::store::{ExecutionEventStore, ExecutionStatus, StoreError};
}

pub use action::EngineAction;
pub use event::ExecutionEvent;
pub use journal::{Journal, JournalEntry, NullJournal, NullStatusSink, StatusSink, StatusUpdate};
pub use machine::{ExecutionSnapshot, GraphMachine, NodePhase, NodeState};
pub use memory::InMemoryExecutionEventStore;
pub use observer::{CompositeObserver, EngineEvent, EngineObserver, NullObserver};
pub use postgres::PostgresExecutionEventStore;
pub use retry::RetryPolicy;
pub use runner::{Engine, EngineConfig, EngineError, ExecutionParams, RunningCounts};
pub use signal::{ExecutionSignal, SignalEnvelope};
pub use store::{ExecutionEventStore, ExecutionStatus, StoreError};
