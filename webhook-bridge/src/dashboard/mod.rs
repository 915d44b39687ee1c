//! # Dashboard Read-Models
//!
//! Aggregation endpoints consumed by the embedded web dashboard. These
//! read from the same tracker, log ring, and stats store as the rest of
//! the API; nothing here has its own state.

use crate::bridge_error::ApiError;
use crate::logs::LogLevel;
use crate::request_context::RequestMeta;
use crate::server::AppState;
use crate::storage::StatsFilter;
use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

/// Connection and service status for the dashboard header.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let executor = state.client.status().await;
    Json(json!({
        "service": "webhook-bridge",
        "version": crate::VERSION,
        "uptime_seconds": state.http_metrics.uptime_seconds(),
        "timestamp": Utc::now().to_rfc3339(),
        "executor": {
            "status": executor.state.as_str(),
            "error": executor.last_error,
            "since": executor.since.to_rfc3339(),
        },
        "workers": state.pool.stats(),
    }))
}

/// Executor plugin list merged with live and persisted counters.
pub async fn plugins(
    State(state): State<AppState>,
    meta: RequestMeta,
) -> Result<Json<Value>, ApiError> {
    let listing = state
        .client
        .list_plugins(None)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    let stats = state.stats.snapshot().await;

    let plugins: Vec<Value> = listing
        .plugins
        .into_iter()
        .map(|info| {
            let realtime = state.tracker.plugin_stats(&info.name);
            let persisted: Vec<&crate::stats::MethodStats> = info
                .supported_methods
                .iter()
                .filter_map(|m| stats.per_plugin.get(&crate::stats::stats_key(&info.name, m)))
                .collect();
            let total: u64 = persisted.iter().map(|s| s.count).sum();
            let errors: u64 = persisted.iter().map(|s| s.errors).sum();
            json!({
                "info": info,
                "realtime": realtime,
                "persisted": { "total": total, "errors": errors },
            })
        })
        .collect();

    Ok(Json(json!({
        "plugins": plugins,
        "total_count": listing.total_count,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
    pub plugin: Option<String>,
    pub limit: Option<usize>,
}

/// Ring filter for the dashboard log pane, newest first.
pub async fn logs(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let level = match &query.level {
        Some(raw) => Some(LogLevel::parse(raw).ok_or_else(|| {
            meta.fail(crate::bridge_error::BridgeError::invalid(format!(
                "unknown log level {raw:?}"
            )))
        })?),
        None => None,
    };

    let entries = state.logs.filter(
        level,
        query.plugin.as_deref(),
        query.limit.unwrap_or(100).min(1000),
    );
    let count = entries.len();
    Ok(Json(json!({ "logs": entries, "count": count })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DashboardStatsQuery {
    pub days: Option<i64>,
    pub plugin: Option<String>,
}

/// Execution statistics panel: historical window plus live totals.
pub async fn stats(
    State(state): State<AppState>,
    meta: RequestMeta,
    Query(query): Query<DashboardStatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = StatsFilter {
        days: query.days.unwrap_or(7).clamp(1, 365),
        plugin_name: query.plugin,
    };
    let history = state
        .tracker
        .stats(&filter)
        .await
        .map_err(|e| meta.fail(e.into()))?;
    let persisted = state.stats.snapshot().await;

    Ok(Json(json!({
        "window_days": filter.days,
        "history": history,
        "totals": persisted.totals,
        "realtime": state.tracker.all_plugin_stats(),
    })))
}
