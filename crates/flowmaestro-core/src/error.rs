//! Error taxonomy for the execution core

use serde::{Deserialize, Serialize};

/// Classification of a failure, shared by node executors, connectors, the
/// engine, and the HTTP layer.
///
/// The kind decides two things: whether the engine's retry budget applies
/// ([`ErrorKind::is_retryable`]) and which HTTP status the API surfaces
/// ([`ErrorKind::http_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// User input was rejected
    Validation,

    /// Missing or invalid credentials
    Auth,

    /// Referenced entity does not exist
    NotFound,

    /// Concurrent modification or uniqueness violation
    Conflict,

    /// Upstream rate limit hit
    RateLimited,

    /// Operation exceeded its deadline
    Timeout,

    /// Transport-level failure
    Network,

    /// Upstream returned a 5xx-class error
    Server,

    /// Work was cancelled before it finished
    Cancelled,

    /// Engine invariant violation: ready nodes exist but none can run
    Deadlock,

    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server",
            Self::Cancelled => "cancelled",
            Self::Deadlock => "deadlock",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the engine should spend retry budget on this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Network | Self::Server
        )
    }

    /// The HTTP status the API uses when surfacing this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::Timeout => 504,
            Self::Network | Self::Server | Self::Cancelled | Self::Deadlock | Self::Unknown => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned by a node executor or connector invocation.
///
/// Executors only classify; the engine decides policy. `retryable` defaults
/// from the kind but an executor may override it (a 400 from an upstream API
/// is `server`-shaped but will never succeed on retry, for example).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl NodeError {
    /// Create an error that the engine may retry.
    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    /// Create an error that exhausts no retry budget.
    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify by kind: retryable kinds retry, the rest do not.
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            retryable: kind.is_retryable(),
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::permanent(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::retryable(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::permanent(ErrorKind::Cancelled, "cancelled")
    }
}

/// Terminal error recorded on a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,

    /// Name of the node whose failure propagated, if any.
    pub failed_node: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            failed_node: None,
        }
    }

    pub fn from_node(node: impl Into<String>, error: &NodeError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            failed_node: Some(node.into()),
        }
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deadlock, message)
    }
}

/// Structural problems in a workflow definition, reported before anything
/// is persisted or executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow has no nodes")]
    Empty,

    #[error("entry point {0:?} is not a node in the workflow")]
    UnknownEntryPoint(String),

    #[error("node key {key:?} does not match its name field {name:?}")]
    NodeNameMismatch { key: String, name: String },

    #[error("edge {edge:?} references unknown node {node:?}")]
    UnknownEdgeNode { edge: String, node: String },

    #[error("duplicate edge id {0:?}")]
    DuplicateEdgeId(String),

    #[error("edge {0:?} connects a node to itself")]
    SelfEdge(String),

    #[error("workflow graph contains a cycle involving {0:?}")]
    Cycle(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Server.is_retryable());

        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Deadlock.is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::RateLimited.http_status(), 429);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::Unknown.http_status(), 500);
    }

    #[test]
    fn test_node_error_classification() {
        let err = NodeError::classified(ErrorKind::Network, "connection reset");
        assert!(err.retryable);

        let err = NodeError::classified(ErrorKind::Validation, "bad config");
        assert!(!err.retryable);
    }

    #[test]
    fn test_error_serialization_uses_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");

        let err = NodeError::retryable(ErrorKind::Server, "upstream 502");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "server");
        assert_eq!(json["retryable"], true);
    }

    #[test]
    fn test_execution_error_from_node() {
        let node_err = NodeError::permanent(ErrorKind::Auth, "token expired");
        let exec_err = ExecutionError::from_node("fetch", &node_err);

        assert_eq!(exec_err.kind, ErrorKind::Auth);
        assert_eq!(exec_err.failed_node.as_deref(), Some("fetch"));
    }
}
