//! Response envelope and API error mapping
//!
//! Every endpoint answers `{"success":true,"data":…}` or
//! `{"success":false,"error":{"code","message","details"}}`; the error code
//! is the core taxonomy kind and the HTTP status follows from it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use flowmaestro_core::ErrorKind;

pub type ApiResult<T> = Result<T, ApiError>;

/// Wrap a payload in the success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, ok(data))
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "internal error");
        Self::server(err.to_string())
    }
}

impl From<flowmaestro_durable::EngineError> for ApiError {
    fn from(err: flowmaestro_durable::EngineError) -> Self {
        use flowmaestro_durable::{EngineError, StoreError};
        match &err {
            EngineError::Definition(e) => Self::validation(e.to_string()),
            EngineError::AlreadyTerminal(_) => Self::conflict(err.to_string()),
            EngineError::Store(StoreError::ExecutionNotFound(_)) => {
                Self::not_found(err.to_string())
            }
            _ => Self::server(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "success": false,
            "error": {
                "code": self.kind.as_str(),
                "message": self.message,
                "details": self.details,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::validation("x").kind.http_status(), 400);
        assert_eq!(ApiError::auth("x").kind.http_status(), 401);
        assert_eq!(ApiError::not_found("x").kind.http_status(), 404);
        assert_eq!(ApiError::conflict("x").kind.http_status(), 409);
        assert_eq!(ApiError::server("x").kind.http_status(), 500);
    }

    #[test]
    fn test_envelope_shape() {
        let Json(body) = ok(json!({"id": 1}));
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 1);
    }
}
