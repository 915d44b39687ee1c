//! # HTTP Request Handlers
//!
//! Every route of the bridge API. Handlers validate at the edge, drive
//! the executor client / tracker / worker pool / stats injected through
//! [`AppState`], and answer with per-endpoint JSON envelopes. Errors
//! always render the standard envelope via
//! [`crate::request_context::RequestMeta::fail`].
//!
//! ## Routes
//!
//! - `GET /health`: overall status with executor and storage sub-checks
//! - `GET /metrics`: HTTP counters, execution counters and pool stats
//! - `GET /workers`, `POST /workers/jobs`: pool introspection, job intake
//! - `GET /api/v1/plugins`, `GET /api/v1/plugins/{plugin}`: executor proxy
//! - `GET|POST|PUT|DELETE /api/v1/webhook/{plugin}`: synchronous invocation
//! - `GET /api/v1/executions*`: execution history read-model and admin
//! - fallback: 404 envelope for API paths, SPA shell otherwise

use crate::bridge_error::{kind, ApiError, BridgeError};
use crate::request_context::RequestMeta;
use crate::server::AppState;
use crate::storage::{ExecutionFilter, ExecutionStatus, StatsFilter};
use crate::tracker::{Completion, Correlation};
use crate::worker::{value_to_text, Job};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use executor_sdk::ExecutePluginRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Hard cap on webhook payloads.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Hard cap on top-level payload fields.
pub const MAX_PAYLOAD_FIELDS: usize = 1000;
/// Longest accepted plugin name.
pub const MAX_PLUGIN_NAME: usize = 100;

/// Validate a plugin name: `^[A-Za-z0-9_-]{1,100}$`.
///
/// The single gate between user-supplied names and the executor; every
/// endpoint taking a plugin name goes through here. Path separators and
/// dot-dot sequences can never pass.
pub fn validate_plugin_name(name: &str) -> Result<(), BridgeError> {
    if name.is_empty() {
        return Err(BridgeError::invalid("Invalid plugin name: empty"));
    }
    if name.len() > MAX_PLUGIN_NAME {
        return Err(BridgeError::invalid(format!(
            "Invalid plugin name: longer than {MAX_PLUGIN_NAME} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(BridgeError::invalid(
            "Invalid plugin name: only letters, digits, underscore and dash are allowed",
        ));
    }
    Ok(())
}

/// Render a millisecond duration the way the API reports execution time.
pub fn format_execution_time(ms: f64) -> String {
    format!("{ms:.3}ms")
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Response {
    let executor = state.client.status().await;
    let storage_ok = state.tracker.storage_health().await.is_ok();

    let executor_healthy = executor.state == executor_sdk::ConnectionState::Healthy;
    let healthy = executor_healthy && storage_ok;

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": crate::VERSION,
        "uptime_seconds": state.http_metrics.uptime_seconds(),
        "timestamp": Utc::now().to_rfc3339(),
        "checks": {
            "executor": {
                "status": executor.state.as_str(),
                "error": executor.last_error,
                "since": executor.since.to_rfc3339(),
            },
            "storage": {
                "status": if storage_ok { "healthy" } else { "unhealthy" },
            },
        },
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let stats = state.stats.snapshot().await;
    Json(json!({
        "http": state.http_metrics.snapshot(),
        "executions": {
            "totals": stats.totals,
            "plugins": state.tracker.all_plugin_stats(),
        },
        "workers": state.pool.stats(),
    }))
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

pub async fn worker_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "workers": state.pool.stats() }))
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    pub max_retry: Option<u32>,
}

pub async fn submit_job(
    State(state): State<AppState>,
    meta: RequestMeta,
    body: Result<Json<SubmitJobRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| meta.fail(BridgeError::invalid(e.to_string())))?;

    if request.job_type.is_empty() {
        return Err(meta.fail(BridgeError::invalid("job type is required")));
    }
    if !request.payload.is_null() && !request.payload.is_object() {
        return Err(meta.fail(BridgeError::invalid("job payload must be an object")));
    }

    let mut job = Job::new(&request.job_type, request.payload);
    job.priority = request.priority;
    job.max_retry = request
        .max_retry
        .unwrap_or_else(|| state.pool.default_max_retry());

    let job_id = state
        .pool
        .submit(job)
        .await
        .map_err(|e| meta.fail(e.into()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "status": "accepted",
            "request_id": meta.request_id,
        })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Plugin catalogue (executor proxy)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListPluginsQuery {
    pub filter: Option<String>,
}

pub async fn list_plugins(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<ListPluginsQuery>,
) -> Result<Json<Value>, ApiError> {
    let response = state
        .client
        .list_plugins(query.filter)
        .await
        .map_err(|e| meta.fail(e.into()))?;

    Ok(Json(json!({
        "plugins": response.plugins,
        "total_count": response.total_count,
    })))
}

pub async fn plugin_info(
    State(state): State<AppState>,
    meta: RequestMeta,
    Path(plugin): Path<String>,
) -> Result<Json<Value>, ApiError> {
    validate_plugin_name(&plugin).map_err(|e| meta.fail(e))?;
    let info = state
        .client
        .get_plugin_info(&plugin)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    Ok(Json(json!({ "plugin": info })))
}

// ---------------------------------------------------------------------------
// Webhook invocation (synchronous path)
// ---------------------------------------------------------------------------

/// The synchronous plugin invocation behind
/// `GET|POST|PUT|DELETE /api/v1/webhook/{plugin}`.
///
/// Validation happens before anything touches the executor: plugin name
/// first, then the payload cap and shape. A valid request opens an
/// execution record, performs the RPC under the configured deadline, and
/// completes the record before the response leaves.
pub async fn webhook(
    State(state): State<AppState>,
    Path(plugin): Path<String>,
    meta: RequestMeta,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    validate_plugin_name(&plugin).map_err(|e| meta.fail(e))?;

    let method = req.method().as_str().to_string();
    let correlation = Correlation {
        trace_id: header_string(&req, "x-trace-id"),
        user_agent: header_string(&req, "user-agent"),
        remote_ip: header_string(&req, "x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string()),
    };

    let data = match method.as_str() {
        "POST" | "PUT" => {
            let bytes = read_body(req).await.map_err(|e| meta.fail(e))?;
            parse_json_payload(&bytes).map_err(|e| meta.fail(e))?
        }
        _ => query_payload(req.uri().query()),
    };

    // Begin tracking. Whether a storage failure aborts the request is the
    // tracker's policy decision, not ours.
    let input = serde_json::to_string(&data).ok();
    let record_id = state
        .tracker
        .begin(&plugin, &method, input.as_deref(), correlation)
        .await
        .map_err(|e| meta.fail(e.into()))?;

    let started = std::time::Instant::now();
    let result = state
        .client
        .execute_plugin(
            ExecutePluginRequest {
                name: plugin.clone(),
                http_method: method.clone(),
                data,
            },
            state.config.executor.timeout(),
        )
        .await;
    let wall_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(response) if !response.is_error() => {
            let status_code = if response.status_code == 0 {
                200
            } else {
                response.status_code
            };

            if let Some(id) = &record_id {
                let output = serde_json::to_string(&response.data).ok();
                state
                    .tracker
                    .complete(id, Completion::success(output))
                    .await
                    .map_err(|e| meta.fail(e.into()))?;
            }

            let exec_ms = if response.execution_time_seconds > 0.0 {
                response.execution_time_seconds * 1000.0
            } else {
                wall_ms
            };
            state
                .stats
                .record_execution(&plugin, &method, exec_ms as i64, true)
                .await;
            state
                .logs
                .add(
                    crate::logs::LogLevel::Info,
                    "webhook",
                    &format!("plugin {plugin} completed"),
                    Some(&plugin),
                    json!({
                        "method": method,
                        "status_code": status_code,
                        "execution_time_ms": exec_ms,
                        "request_id": meta.request_id,
                    }),
                )
                .await;

            let mut body = json!({
                "plugin": plugin,
                "method": method,
                "status_code": status_code,
                "message": response.message,
                "execution_time": format_execution_time(exec_ms),
                "request_id": meta.request_id,
            });
            if !response.data.is_empty() {
                body["data"] = json!(response.data);
            }

            let status =
                StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
            Ok((status, Json(body)).into_response())
        }
        Ok(response) => {
            // The plugin ran and raised: the runtime owns the status code.
            let status_code = if response.status_code == 0 {
                500
            } else {
                response.status_code
            };

            if let Some(id) = &record_id {
                state
                    .tracker
                    .complete(
                        id,
                        Completion::failure(response.error.clone(), kind::PLUGIN_RUNTIME),
                    )
                    .await
                    .map_err(|e| meta.fail(e.into()))?;
            }
            state
                .stats
                .record_execution(&plugin, &method, wall_ms as i64, false)
                .await;
            state
                .logs
                .add(
                    crate::logs::LogLevel::Error,
                    "webhook",
                    &format!("plugin {plugin} failed"),
                    Some(&plugin),
                    json!({
                        "method": method,
                        "status_code": status_code,
                        "error": response.error,
                        "request_id": meta.request_id,
                    }),
                )
                .await;

            let body = json!({
                "plugin": plugin,
                "method": method,
                "status_code": status_code,
                "message": response.message,
                "error": response.error,
                "error_type": kind::PLUGIN_RUNTIME,
                "execution_time": format_execution_time(wall_ms),
                "request_id": meta.request_id,
            });
            let status =
                StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok((status, Json(body)).into_response())
        }
        Err(e) => {
            let bridge_err: BridgeError = e.into();
            if let Some(id) = &record_id {
                let completion = match &bridge_err {
                    BridgeError::Timeout { message } => Completion::timeout(message.clone()),
                    other => Completion::failure(other.to_string(), other.kind()),
                };
                state
                    .tracker
                    .complete(id, completion)
                    .await
                    .map_err(|te| meta.fail(te.into()))?;
            }
            state
                .stats
                .record_execution(&plugin, &method, wall_ms as i64, false)
                .await;
            state
                .logs
                .add(
                    crate::logs::LogLevel::Error,
                    "webhook",
                    &format!("plugin {plugin} invocation failed: {bridge_err}"),
                    Some(&plugin),
                    json!({
                        "method": method,
                        "error_type": bridge_err.kind(),
                        "request_id": meta.request_id,
                    }),
                )
                .await;

            Err(meta.fail(bridge_err))
        }
    }
}

fn header_string(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Buffer the body under the payload cap; overflow is a client error,
/// answered before any RPC happens.
async fn read_body(req: Request<Body>) -> Result<Bytes, BridgeError> {
    axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| {
            BridgeError::invalid(format!(
                "payload exceeds the {MAX_BODY_BYTES} byte limit"
            ))
        })
}

/// Parse a JSON object body into the executor's `map<string,string>`
/// shape: at most [`MAX_PAYLOAD_FIELDS`] top-level fields, every value
/// rendered as text.
fn parse_json_payload(bytes: &[u8]) -> Result<HashMap<String, String>, BridgeError> {
    if bytes.is_empty() {
        return Ok(HashMap::new());
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| BridgeError::invalid(format!("invalid JSON payload: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| BridgeError::invalid("payload must be a JSON object"))?;
    if object.len() > MAX_PAYLOAD_FIELDS {
        return Err(BridgeError::invalid(format!(
            "payload has more than {MAX_PAYLOAD_FIELDS} top-level fields"
        )));
    }
    Ok(object
        .iter()
        .map(|(k, v)| (k.clone(), value_to_text(v)))
        .collect())
}

/// Query-string payload for GET/DELETE: first value wins per key.
fn query_payload(query: Option<&str>) -> HashMap<String, String> {
    let mut data = HashMap::new();
    let Some(query) = query else {
        return data;
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key);
        let value = percent_decode(value);
        data.entry(key).or_insert(value);
    }
    data
}

/// Minimal percent-decoding for query parameters ('+' means space).
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let decoded = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                );
                if let (Some(hi), Some(lo)) = decoded {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Execution history
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionsQuery {
    pub plugin: Option<String>,
    pub status: Option<String>,
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub error_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(ExecutionStatus::parse(raw).ok_or_else(|| {
            meta.fail(BridgeError::invalid(format!("unknown status {raw:?}")))
        })?),
        None => None,
    };
    if let Some(plugin) = &query.plugin {
        validate_plugin_name(plugin).map_err(|e| meta.fail(e))?;
    }

    let filter = ExecutionFilter {
        plugin_name: query.plugin,
        status,
        start_after: query.start_after,
        start_before: query.start_before,
        trace_id: query.trace_id,
        error_type: query.error_type,
        limit: query.limit,
        offset: query.offset,
    };
    let executions = state
        .tracker
        .history(&filter)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    let count = executions.len();

    Ok(Json(json!({
        "executions": executions,
        "count": count,
    })))
}

pub async fn get_execution(
    State(state): State<AppState>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let execution = state
        .tracker
        .get(&id)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    Ok(Json(json!({ "execution": execution })))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub days: Option<i64>,
    pub plugin: Option<String>,
}

pub async fn execution_stats(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(plugin) = &query.plugin {
        validate_plugin_name(plugin).map_err(|e| meta.fail(e))?;
    }
    let filter = StatsFilter {
        days: query.days.unwrap_or(7).clamp(1, 365),
        plugin_name: query.plugin,
    };
    let stats = state
        .tracker
        .stats(&filter)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    Ok(Json(json!({ "stats": stats, "window_days": filter.days })))
}

pub async fn plugin_execution_stats(
    State(state): State<AppState>,
    meta: RequestMeta,
    Path(plugin): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    validate_plugin_name(&plugin).map_err(|e| meta.fail(e))?;
    let filter = StatsFilter {
        days: query.days.unwrap_or(7).clamp(1, 365),
        plugin_name: Some(plugin.clone()),
    };
    let stats = state
        .tracker
        .stats(&filter)
        .await
        .map_err(|e| meta.fail(e.into()))?;

    Ok(Json(json!({
        "plugin": plugin,
        "stats": stats,
        "realtime": state.tracker.plugin_stats(&plugin),
        "window_days": filter.days,
    })))
}

pub async fn cleanup_executions(
    State(state): State<AppState>,
    meta: RequestMeta,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .tracker
        .cleanup()
        .await
        .map_err(|e| meta.fail(e.into()))?;
    Ok(Json(json!({
        "deleted": deleted,
        "retention_days": state.tracker.config().retention_days,
    })))
}

pub async fn storage_info(
    State(state): State<AppState>,
    meta: RequestMeta,
) -> Result<Json<Value>, ApiError> {
    let info = state
        .tracker
        .storage_info()
        .await
        .map_err(|e| meta.fail(e.into()))?;
    Ok(Json(json!({ "storage": info })))
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// API paths get a 404 envelope; anything else falls back to the
/// dashboard SPA shell so client-side routes deep-link correctly.
pub async fn fallback(meta: RequestMeta) -> Response {
    let is_api = meta.path.starts_with("/api/")
        || matches!(meta.path.as_str(), "/health" | "/metrics" | "/workers");
    if is_api {
        return meta
            .fail(BridgeError::NotFound {
                message: format!("no route for {} {}", meta.method, meta.path),
            })
            .into_response();
    }
    Html(DASHBOARD_SHELL).into_response()
}

/// Minimal shell for the embedded dashboard; the real UI assets are an
/// external collaborator and load themselves from here.
const DASHBOARD_SHELL: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Webhook Bridge</title>
</head>
<body>
  <div id="app" data-api-base="/api/dashboard"></div>
  <noscript>The webhook-bridge dashboard requires JavaScript.</noscript>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_name_grammar() {
        assert!(validate_plugin_name("hello").is_ok());
        assert!(validate_plugin_name("Hello-World_2").is_ok());
        assert!(validate_plugin_name(&"a".repeat(100)).is_ok());

        assert!(validate_plugin_name("").is_err());
        assert!(validate_plugin_name(&"a".repeat(101)).is_err());
        assert!(validate_plugin_name("../etc").is_err());
        assert!(validate_plugin_name("a/b").is_err());
        assert!(validate_plugin_name("a\\b").is_err());
        assert!(validate_plugin_name("a..b").is_err());
        assert!(validate_plugin_name("a b").is_err());
        assert!(validate_plugin_name("a.b").is_err());
    }

    #[test]
    fn execution_time_rendering() {
        assert_eq!(format_execution_time(45.0), "45.000ms");
        assert_eq!(format_execution_time(0.5), "0.500ms");
        assert_eq!(format_execution_time(1234.5678), "1234.568ms");
    }

    #[test]
    fn json_payload_normalises_values_to_text() {
        let data =
            parse_json_payload(br#"{"name":"world","count":3,"deep":{"a":1},"flag":true}"#).unwrap();
        assert_eq!(data["name"], "world");
        assert_eq!(data["count"], "3");
        assert_eq!(data["deep"], r#"{"a":1}"#);
        assert_eq!(data["flag"], "true");
    }

    #[test]
    fn json_payload_rejects_non_objects_and_bad_json() {
        assert!(parse_json_payload(b"[1,2,3]").is_err());
        assert!(parse_json_payload(b"\"str\"").is_err());
        assert!(parse_json_payload(b"{not json").is_err());
        assert!(parse_json_payload(b"").unwrap().is_empty());
    }

    #[test]
    fn json_payload_field_cap() {
        let mut object = serde_json::Map::new();
        for i in 0..=MAX_PAYLOAD_FIELDS {
            object.insert(format!("k{i}"), json!(i));
        }
        let bytes = serde_json::to_vec(&Value::Object(object)).unwrap();
        assert!(parse_json_payload(&bytes).is_err());
    }

    #[test]
    fn query_payload_takes_first_value() {
        let data = query_payload(Some("a=1&b=two&a=3&empty"));
        assert_eq!(data["a"], "1");
        assert_eq!(data["b"], "two");
        assert_eq!(data["empty"], "");
    }

    #[test]
    fn query_payload_decodes_percent_and_plus() {
        let data = query_payload(Some("name=hello%20world&msg=a+b&pct=100%25"));
        assert_eq!(data["name"], "hello world");
        assert_eq!(data["msg"], "a b");
        assert_eq!(data["pct"], "100%");
    }
}
