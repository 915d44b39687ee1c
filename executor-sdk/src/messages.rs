//! # Executor Wire Messages
//!
//! This module defines the stable wire types exchanged with the plugin
//! executor process. The executor exposes four unary operations over its
//! RPC endpoint; each operation has exactly one request and one response
//! message defined here.
//!
//! ## Operations
//!
//! - **HealthCheck**: liveness probe for the executor service
//! - **ListPlugins**: enumerate loaded plugins, optionally filtered
//! - **GetPluginInfo**: metadata for a single named plugin
//! - **ExecutePlugin**: invoke a plugin with string key/value data
//!
//! These types are the contract boundary: field names and shapes must not
//! change without a coordinated executor release. New fields are added as
//! `Option` with `#[serde(default)]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request for the executor liveness probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    /// Service name to probe; empty string probes the executor itself.
    #[serde(default)]
    pub service: String,
}

/// Response to a health check probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Whether the probed service is healthy.
    pub healthy: bool,
    /// Human-readable status detail.
    #[serde(default)]
    pub message: String,
}

/// Request to enumerate plugins loaded in the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPluginsRequest {
    /// Optional substring filter applied to plugin names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Response listing loaded plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPluginsResponse {
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
    /// Total number of plugins known to the executor, before filtering.
    #[serde(default)]
    pub total_count: u32,
}

/// Metadata describing a single plugin hosted by the executor.
///
/// Transient data: the bridge never persists plugin info, it is re-fetched
/// from the executor on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginInfo {
    pub name: String,
    /// Filesystem path of the plugin source inside the executor.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: String,
    /// HTTP methods the plugin declares handlers for.
    #[serde(default)]
    pub supported_methods: Vec<String>,
    /// False when the plugin failed to load or was unloaded.
    #[serde(default)]
    pub is_available: bool,
    /// Last modification time of the plugin source, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// Request for metadata of one named plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPluginInfoRequest {
    pub name: String,
}

/// Response carrying metadata for one plugin, if it exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginInfo>,
    pub found: bool,
}

/// Request to invoke a plugin.
///
/// `data` is the normalised webhook payload: every value has already been
/// converted to its textual representation by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePluginRequest {
    pub name: String,
    /// HTTP method the webhook arrived with (`GET`/`POST`/`PUT`/`DELETE`).
    pub http_method: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// Response from a plugin invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutePluginResponse {
    /// HTTP-style status code chosen by the plugin; 0 means "unset" and is
    /// normalised to 200 by the caller.
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
    /// Plugin output data, string key/value pairs.
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// Error detail when the plugin raised; empty on success.
    #[serde(default)]
    pub error: String,
    /// Wall-clock execution time measured inside the executor, in seconds.
    #[serde(default)]
    pub execution_time_seconds: f64,
}

impl ExecutePluginResponse {
    /// Executor-side execution time converted to whole milliseconds.
    pub fn execution_time_ms(&self) -> i64 {
        (self.execution_time_seconds * 1000.0).round() as i64
    }

    /// True when the executor reported a plugin-raised error.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_response_defaults_tolerate_missing_fields() {
        let resp: ExecutePluginResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.status_code, 0);
        assert!(resp.data.is_empty());
        assert!(!resp.is_error());
    }

    #[test]
    fn execution_time_rounds_to_millis() {
        let resp = ExecutePluginResponse {
            execution_time_seconds: 0.045,
            ..Default::default()
        };
        assert_eq!(resp.execution_time_ms(), 45);

        let resp = ExecutePluginResponse {
            execution_time_seconds: 0.0004,
            ..Default::default()
        };
        assert_eq!(resp.execution_time_ms(), 0);
    }

    #[test]
    fn plugin_info_round_trips() {
        let info = PluginInfo {
            name: "hello".to_string(),
            path: "/plugins/hello.py".to_string(),
            description: "greeting plugin".to_string(),
            supported_methods: vec!["GET".to_string(), "POST".to_string()],
            is_available: true,
            last_modified: Some("2026-01-01T00:00:00Z".to_string()),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: PluginInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
