//! # Bridge Error Types
//!
//! The bridge-wide error model: one variant per error kind of the system
//! contract, a stable kind string for each, and the HTTP mapping used by
//! every handler. The JSON error envelope is
//! `{error, message, details?, path, method, request_id?, timestamp}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use executor_sdk::ExecutorError;
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;
use crate::tracker::TrackerError;
use crate::worker::WorkerError;

/// The wire strings of the error kinds, shared across all layers.
pub mod kind {
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const TRANSPORT: &str = "transport";
    pub const PLUGIN_RUNTIME: &str = "plugin_runtime";
    pub const TIMEOUT: &str = "timeout";
    pub const STORAGE: &str = "storage";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const INTERNAL: &str = "internal";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Failures surfaced by the HTTP layer.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Validation failures: plugin name, payload shape, JSON parse.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Unknown plugin or execution record.
    #[error("{message}")]
    NotFound { message: String },

    /// The executor transport is broken.
    #[error("executor unavailable: {message}")]
    Transport { message: String },

    /// The plugin ran and raised; the runtime chose the status code.
    #[error("plugin error: {message}")]
    PluginRuntime { status_code: u16, message: String },

    /// A deadline elapsed.
    #[error("deadline exceeded: {message}")]
    Timeout { message: String },

    /// The execution store failed and the failure policy says surface it.
    #[error("storage failure: {message}")]
    Storage { message: String },

    /// The worker queue is full.
    #[error("worker queue full")]
    Backpressure,

    /// Panic recovery or unclassified failure.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// The process is draining.
    #[error("shutting down")]
    Shutdown,
}

impl BridgeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        BridgeError::Internal {
            message: message.into(),
        }
    }

    /// Stable kind string for the envelope and the execution record's
    /// `error_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument { .. } => kind::INVALID_ARGUMENT,
            BridgeError::NotFound { .. } => kind::NOT_FOUND,
            BridgeError::Transport { .. } => kind::TRANSPORT,
            BridgeError::PluginRuntime { .. } => kind::PLUGIN_RUNTIME,
            BridgeError::Timeout { .. } => kind::TIMEOUT,
            BridgeError::Storage { .. } => kind::STORAGE,
            BridgeError::Backpressure => kind::BACKPRESSURE,
            BridgeError::Internal { .. } => kind::INTERNAL,
            BridgeError::Shutdown => kind::SHUTDOWN,
        }
    }

    /// HTTP status for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            BridgeError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::PluginRuntime { status_code, .. } => {
                StatusCode::from_u16(*status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<ExecutorError> for BridgeError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Transport { message } => BridgeError::Transport { message },
            ExecutorError::Unavailable => BridgeError::Transport {
                message: "executor connection is down".to_string(),
            },
            ExecutorError::Timeout { timeout_ms } => BridgeError::Timeout {
                message: format!("executor call exceeded {timeout_ms}ms"),
            },
            ExecutorError::PluginNotFound { name } => BridgeError::NotFound {
                message: format!("plugin not found: {name}"),
            },
            ExecutorError::PluginRuntime {
                status_code,
                message,
            } => BridgeError::PluginRuntime {
                status_code,
                message,
            },
            other => BridgeError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<StorageError> for BridgeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { id } => BridgeError::NotFound {
                message: format!("execution record not found: {id}"),
            },
            other => BridgeError::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<TrackerError> for BridgeError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Storage(e) => e.into(),
        }
    }
}

impl From<WorkerError> for BridgeError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Backpressure => BridgeError::Backpressure,
            WorkerError::Shutdown => BridgeError::Shutdown,
            WorkerError::UnknownType(t) => BridgeError::invalid(format!("unknown job type: {t}")),
        }
    }
}

/// A [`BridgeError`] bound to its request context, ready to render as the
/// standard envelope. Handlers construct it via
/// [`crate::request_context::RequestMeta::fail`].
#[derive(Debug)]
pub struct ApiError {
    pub error: BridgeError,
    pub path: String,
    pub method: String,
    pub request_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let mut body = json!({
            "error": self.error.kind(),
            "message": self.error.to_string(),
            "path": self.path,
            "method": self.method,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(request_id) = &self.request_id {
            body["request_id"] = json!(request_id);
        }
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

// Fallback for errors escaping without request context (panic recovery).
impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_statuses() {
        assert_eq!(BridgeError::invalid("x").kind(), "invalid_argument");
        assert_eq!(BridgeError::invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BridgeError::Transport { message: "x".into() }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BridgeError::Timeout { message: "x".into() }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(BridgeError::Backpressure.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(BridgeError::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn plugin_runtime_uses_runtime_status() {
        let err = BridgeError::PluginRuntime {
            status_code: 422,
            message: "bad input".into(),
        };
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err = BridgeError::PluginRuntime {
            status_code: 0,
            message: "weird".into(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn executor_errors_map_to_bridge_kinds() {
        let err: BridgeError = ExecutorError::Unavailable.into();
        assert_eq!(err.kind(), "transport");

        let err: BridgeError = ExecutorError::Timeout { timeout_ms: 100 }.into();
        assert_eq!(err.kind(), "timeout");

        let err: BridgeError = ExecutorError::PluginNotFound { name: "x".into() }.into();
        assert_eq!(err.kind(), "not_found");
    }
}
