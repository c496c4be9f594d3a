//! # FlowMaestro Core
//!
//! Domain types shared by every other crate in the workspace:
//!
//! - Workflow definitions: the node/edge wire format, validation, and
//!   topology helpers ([`definition`])
//! - The error taxonomy used across the engine, connectors, and the API
//!   ([`error`])
//! - The `${path}` interpolation evaluator and layered variable scope
//!   ([`interpolate`])
//! - The node executor seam: [`executor::NodeExecutor`],
//!   [`executor::NodeContext`], and the process-wide registry
//! - The connector seam for third-party integrations ([`connector`])
//! - Environment configuration ([`config`])
//!
//! This crate is deliberately free of I/O: everything here is pure data and
//! trait definitions so the engine can stay deterministic and testable.

pub mod config;
pub mod connector;
pub mod definition;
pub mod error;
pub mod executor;
pub mod interpolate;

pub use config::Config;
pub use connector::{Connector, ConnectorOperation, ConnectorRegistry};
pub use definition::{
    node_types, EdgeDefinition, ErrorStrategy, NodeDefinition, OnErrorPolicy, Position,
    WorkflowDefinition, WorkflowSettings,
};
pub use error::{DefinitionError, ErrorKind, ExecutionError, NodeError};
pub use executor::{
    ExecutorRegistry, LogLevel, NodeContext, NodeMetadata, NodeExecutor, VariableScope,
};
pub use interpolate::{Interpolator, Rendered, ResolutionMode, Scope, Selector};
