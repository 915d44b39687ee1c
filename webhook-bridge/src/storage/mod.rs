//! # Execution Storage
//!
//! Persistent storage for webhook execution records. The model lives here;
//! the SQLite implementation is in [`sqlite`], the versioned schema in
//! [`migrations`].
//!
//! Invariants enforced across the store:
//!
//! - `attempts == retry_count + 1` at all times.
//! - `end_time >= start_time` when both are set; `duration_ms` is their
//!   difference.
//! - Terminal statuses (`completed`, `failed`, `timeout`) always carry an
//!   `end_time`.
//! - Records are inserted once with a non-terminal status; later writes
//!   touch only the completion columns.
//! - Retention cleanup deletes by `created_at` and never removes records
//!   that are still `pending` or `running`.
//!
//! Durations are milliseconds everywhere in this crate; boundaries convert.

pub mod migrations;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use sqlite::SqliteExecutionStore;

/// Marker appended to captured input/output cut at the configured budget.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Errors from the execution store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("execution record not found: {id}")]
    NotFound { id: String },

    #[error("storage misconfigured: {message}")]
    Config { message: String },
}

impl StorageError {
    /// Bridge-wide error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "not_found",
            _ => "storage",
        }
    }
}

/// Lifecycle status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses may never be deleted out from under a reader and
    /// always carry an end time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// One webhook execution, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub plugin_name: String,
    pub http_method: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Captured request payload, truncated to the configured budget.
    pub input: Option<String>,
    /// Captured plugin output, truncated to the configured budget.
    pub output: Option<String>,
    pub error: Option<String>,
    /// Error kind string (`transport`, `timeout`, ...), set on failure.
    pub error_type: Option<String>,
    /// Wall-clock duration in milliseconds, set on completion.
    pub duration_ms: Option<i64>,
    pub attempts: i64,
    pub retry_count: i64,
    pub trace_id: Option<String>,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    pub tags: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A fresh record in `running` state, starting now.
    pub fn begin(plugin_name: &str, http_method: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_execution_id(),
            plugin_name: plugin_name.to_string(),
            http_method: http_method.to_string(),
            start_time: now,
            end_time: None,
            status: ExecutionStatus::Running,
            input: None,
            output: None,
            error: None,
            error_type: None,
            duration_ms: None,
            attempts: 1,
            retry_count: 0,
            trace_id: None,
            user_agent: None,
            remote_ip: None,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-attempt row kept under a parent execution record when the worker
/// pool retries a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub execution_id: String,
    pub attempt_number: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Completion data applied to a running record in a single write.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub attempts: Option<i64>,
    pub retry_count: Option<i64>,
}

/// Filter for listing execution records. Results are ordered by
/// `start_time` descending.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub plugin_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub error_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filter for aggregated statistics over a window of days.
#[derive(Debug, Clone)]
pub struct StatsFilter {
    pub days: i64,
    pub plugin_name: Option<String>,
}

impl Default for StatsFilter {
    fn default() -> Self {
        Self {
            days: 7,
            plugin_name: None,
        }
    }
}

/// Aggregated execution statistics for a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub pending: i64,
    pub running: i64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub unique_plugins: i64,
    /// completed / (completed + failed + timeout), 0.0 when nothing finished.
    pub success_rate: f64,
    pub per_day: Vec<DailyBreakdown>,
}

/// One day of the stats window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBreakdown {
    /// Calendar date, `YYYY-MM-DD` (UTC).
    pub date: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub avg_duration_ms: f64,
}

/// Operational info about the store, surfaced by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub backend: String,
    pub path: String,
    pub size_bytes: u64,
    pub execution_count: i64,
    pub schema_version: i64,
}

/// Generate a new execution record id from the process RNG.
pub fn new_execution_id() -> String {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

/// Cut `value` to at most `max_bytes` bytes on a char boundary, appending
/// [`TRUNCATION_MARKER`] when anything was dropped. Truncation is always
/// explicit, never silent.
pub fn truncate_capture(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &value[..cut], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("cancelled"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn begin_satisfies_attempt_invariant() {
        let record = ExecutionRecord::begin("hello", "POST");
        assert_eq!(record.attempts, record.retry_count + 1);
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.id.starts_with("exec_"));
        assert!(record.end_time.is_none());
    }

    #[test]
    fn execution_ids_are_unique() {
        let a = new_execution_id();
        let b = new_execution_id();
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_short_value_is_identity() {
        assert_eq!(truncate_capture("hello", 100), "hello");
    }

    #[test]
    fn truncate_marks_oversize_values() {
        let long = "x".repeat(50);
        let cut = truncate_capture(&long, 10);
        assert_eq!(cut, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // Multi-byte snowman characters; cutting mid-char must back off.
        let value = "☃☃☃☃";
        let cut = truncate_capture(value, 4);
        assert!(cut.starts_with('☃'));
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(!cut.contains('\u{FFFD}'));
    }
}
