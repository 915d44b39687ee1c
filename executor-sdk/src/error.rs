//! # Executor Client Errors
//!
//! Error types for the executor RPC client. Every variant maps to one of
//! the bridge-wide error kind strings, so upper layers can classify
//! failures without matching on variants directly.

use thiserror::Error;

/// Errors surfaced by [`crate::client::ExecutorClient`] calls.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The transport to the executor is broken: connection refused, reset,
    /// or the dial itself failed.
    #[error("executor transport error: {message}")]
    Transport { message: String },

    /// The executor is known to be down and the call was rejected without
    /// touching the network. Callers get this immediately while the
    /// reconnect loop runs in the background.
    #[error("executor unavailable")]
    Unavailable,

    /// The per-call deadline elapsed before the executor answered.
    #[error("executor call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The executor answered but the named plugin does not exist.
    #[error("plugin not found: {name}")]
    PluginNotFound { name: String },

    /// The plugin ran and raised; carries the runtime's error message and
    /// the status code it chose.
    #[error("plugin runtime error ({status_code}): {message}")]
    PluginRuntime { status_code: u16, message: String },

    /// The executor returned a body the client could not decode.
    #[error("invalid executor response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// Unclassified failure inside the client.
    #[error("executor client error: {message}")]
    Internal { message: String },
}

impl ExecutorError {
    /// The bridge-wide error kind string for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Transport { .. } | ExecutorError::Unavailable => "transport",
            ExecutorError::Timeout { .. } => "timeout",
            ExecutorError::PluginNotFound { .. } => "not_found",
            ExecutorError::PluginRuntime { .. } => "plugin_runtime",
            ExecutorError::InvalidResponse(_) | ExecutorError::Internal { .. } => "internal",
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Transport { .. }
                | ExecutorError::Unavailable
                | ExecutorError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest's own timeout; normalised to the deadline kind.
            ExecutorError::Timeout { timeout_ms: 0 }
        } else if err.is_connect() || err.is_request() {
            ExecutorError::Transport {
                message: err.to_string(),
            }
        } else if err.is_decode() {
            ExecutorError::Internal {
                message: format!("response decode failed: {err}"),
            }
        } else {
            ExecutorError::Transport {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_wire_strings() {
        assert_eq!(
            ExecutorError::Transport {
                message: "refused".into()
            }
            .kind(),
            "transport"
        );
        assert_eq!(ExecutorError::Unavailable.kind(), "transport");
        assert_eq!(
            ExecutorError::Timeout { timeout_ms: 30_000 }.kind(),
            "timeout"
        );
        assert_eq!(
            ExecutorError::PluginNotFound {
                name: "hello".into()
            }
            .kind(),
            "not_found"
        );
        assert_eq!(
            ExecutorError::PluginRuntime {
                status_code: 500,
                message: "boom".into()
            }
            .kind(),
            "plugin_runtime"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(ExecutorError::Unavailable.is_retryable());
        assert!(ExecutorError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(!ExecutorError::PluginNotFound { name: "x".into() }.is_retryable());
        assert!(!ExecutorError::PluginRuntime {
            status_code: 500,
            message: "boom".into()
        }
        .is_retryable());
    }
}
