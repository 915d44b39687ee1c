//! # Execution Tracker
//!
//! Begin/complete lifecycle wrapper over the execution store, plus the
//! in-memory real-time counters read by `/metrics` and the dashboard.
//!
//! The tracker decides what happens when the store misbehaves: by default
//! a tracking failure is logged and swallowed so the webhook itself still
//! runs (`fail_requests_on_storage_error = false`); operators who need
//! strict audit trails can flip the flag and fail the request instead.
//!
//! A single background retention sweep deletes records older than the
//! configured age; it never runs concurrently with itself and is stopped
//! through the process-wide cancellation token.

use crate::storage::{
    truncate_capture, ExecutionAttempt, ExecutionFilter, ExecutionRecord, ExecutionStats,
    ExecutionStatus, ExecutionUpdate, SqliteExecutionStore, StatsFilter, StorageError, StorageInfo,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tracker behaviour knobs, taken from the `tracking` config group.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub enabled: bool,
    /// When true, storage failures during begin/complete fail the request.
    pub fail_requests_on_storage_error: bool,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    pub cleanup_interval: Duration,
    pub retention_days: i64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_requests_on_storage_error: false,
            max_input_bytes: 64 * 1024,
            max_output_bytes: 64 * 1024,
            cleanup_interval: Duration::from_secs(60 * 60),
            retention_days: 30,
        }
    }
}

/// Request correlation data captured on begin.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub trace_id: Option<String>,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
}

/// Outcome applied to a running record.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
}

impl Completion {
    pub fn success(output: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output,
            error: None,
            error_type: None,
        }
    }

    pub fn failure(error: impl Into<String>, error_type: &str) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(error.into()),
            error_type: Some(error_type.to_string()),
        }
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            output: None,
            error: Some(error.into()),
            error_type: Some("timeout".to_string()),
        }
    }
}

/// Errors from the tracker. Only raised when the storage failure policy
/// says tracking problems must fail the request.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("execution tracking failed: {0}")]
    Storage(#[from] StorageError),
}

impl TrackerError {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Storage(e) => e.kind(),
        }
    }
}

/// Live per-plugin counters, kept only in memory. The store remains the
/// source of truth for historical queries.
#[derive(Debug, Default, Clone)]
struct PluginRealtime {
    total: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: i64,
    min_duration_ms: Option<i64>,
    max_duration_ms: Option<i64>,
    last_execution: Option<DateTime<Utc>>,
    error_types: HashMap<String, u64>,
}

/// Serialisable snapshot of one plugin's real-time counters.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatsSnapshot {
    pub plugin: String,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub last_execution: Option<DateTime<Utc>>,
    pub error_types: HashMap<String, u64>,
}

/// Tracks webhook executions against the persistent store.
pub struct ExecutionTracker {
    store: Arc<SqliteExecutionStore>,
    config: TrackingConfig,
    realtime: DashMap<String, PluginRealtime>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<SqliteExecutionStore>, config: TrackingConfig) -> Self {
        Self {
            store,
            config,
            realtime: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Open an execution record in `running` state.
    ///
    /// Returns `None` when tracking is disabled, or when the store failed
    /// and the failure policy allows the request to proceed untracked.
    pub async fn begin(
        &self,
        plugin_name: &str,
        http_method: &str,
        input: Option<&str>,
        correlation: Correlation,
    ) -> Result<Option<String>, TrackerError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let mut record = ExecutionRecord::begin(plugin_name, http_method);
        record.input = input.map(|i| truncate_capture(i, self.config.max_input_bytes));
        record.trace_id = correlation.trace_id;
        record.user_agent = correlation.user_agent;
        record.remote_ip = correlation.remote_ip;

        match self.store.save(&record).await {
            Ok(()) => Ok(Some(record.id)),
            Err(e) if self.config.fail_requests_on_storage_error => Err(e.into()),
            Err(e) => {
                tracing::warn!(plugin = plugin_name, error = %e, "dropping execution tracking");
                Ok(None)
            }
        }
    }

    /// Close a record opened by [`Self::begin`] and fold the result into
    /// the real-time counters.
    ///
    /// One read to recover the start time, one write for all completion
    /// columns. Counter updates happen only after the write succeeds.
    pub async fn complete(
        &self,
        record_id: &str,
        completion: Completion,
    ) -> Result<(), TrackerError> {
        let record = match self.store.get(record_id).await {
            Ok(record) => record,
            Err(e) if self.config.fail_requests_on_storage_error => return Err(e.into()),
            Err(e) => {
                tracing::warn!(record_id, error = %e, "cannot complete execution record");
                return Ok(());
            }
        };

        let end_time = Utc::now();
        let duration_ms = (end_time - record.start_time).num_milliseconds().max(0);

        let update = ExecutionUpdate {
            status: Some(completion.status),
            end_time: Some(end_time),
            duration_ms: Some(duration_ms),
            output: completion
                .output
                .as_deref()
                .map(|o| truncate_capture(o, self.config.max_output_bytes)),
            error: completion.error.clone(),
            error_type: completion.error_type.clone(),
            ..Default::default()
        };

        match self.store.update(record_id, &update).await {
            Ok(()) => {
                self.update_realtime(&record.plugin_name, &completion, duration_ms, end_time);
                Ok(())
            }
            Err(e) if self.config.fail_requests_on_storage_error => Err(e.into()),
            Err(e) => {
                tracing::warn!(record_id, error = %e, "cannot complete execution record");
                Ok(())
            }
        }
    }

    /// Record a retry attempt under an existing parent record and bump the
    /// parent's attempt counters, keeping `attempts == retry_count + 1`.
    pub async fn record_retry_attempt(
        &self,
        record_id: &str,
        attempt: ExecutionAttempt,
    ) -> Result<(), TrackerError> {
        let attempts = attempt.attempt_number.max(1);
        let result = async {
            self.store.record_attempt(&attempt).await?;
            self.store
                .update(
                    record_id,
                    &ExecutionUpdate {
                        attempts: Some(attempts),
                        retry_count: Some(attempts - 1),
                        ..Default::default()
                    },
                )
                .await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if self.config.fail_requests_on_storage_error => Err(e.into()),
            Err(e) => {
                tracing::warn!(record_id, error = %e, "cannot record retry attempt");
                Ok(())
            }
        }
    }

    /// Historical records, straight from the store.
    pub async fn history(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, TrackerError> {
        Ok(self.store.list(filter).await?)
    }

    /// One record by id.
    pub async fn get(&self, id: &str) -> Result<ExecutionRecord, TrackerError> {
        Ok(self.store.get(id).await?)
    }

    /// Aggregated statistics over a day window.
    pub async fn stats(&self, filter: &StatsFilter) -> Result<ExecutionStats, TrackerError> {
        Ok(self.store.stats(filter).await?)
    }

    /// Real-time counters for one plugin.
    pub fn plugin_stats(&self, plugin_name: &str) -> Option<PluginStatsSnapshot> {
        self.realtime
            .get(plugin_name)
            .map(|entry| snapshot(plugin_name, entry.value()))
    }

    /// Real-time counters for every plugin seen this process lifetime.
    pub fn all_plugin_stats(&self) -> Vec<PluginStatsSnapshot> {
        let mut stats: Vec<_> = self
            .realtime
            .iter()
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect();
        stats.sort_by(|a, b| a.plugin.cmp(&b.plugin));
        stats
    }

    /// Run one retention sweep now. Returns deleted record count.
    pub async fn cleanup(&self) -> Result<u64, TrackerError> {
        let deleted = self
            .store
            .cleanup_older_than(self.config.retention_days)
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, retention_days = self.config.retention_days, "retention sweep");
        }
        Ok(deleted)
    }

    pub async fn storage_info(&self) -> Result<StorageInfo, TrackerError> {
        Ok(self.store.info().await?)
    }

    pub async fn storage_health(&self) -> Result<(), TrackerError> {
        Ok(self.store.health_check().await?)
    }

    /// Spawn the background retention sweep.
    pub fn spawn_retention_worker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup does not
            // race a sweep against migration-heavy boots.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("retention worker stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.cleanup().await {
                            tracing::error!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }

    fn update_realtime(
        &self,
        plugin_name: &str,
        completion: &Completion,
        duration_ms: i64,
        end_time: DateTime<Utc>,
    ) {
        let mut entry = self.realtime.entry(plugin_name.to_string()).or_default();
        entry.total += 1;
        entry.total_duration_ms += duration_ms;
        entry.last_execution = Some(end_time);
        entry.min_duration_ms = Some(match entry.min_duration_ms {
            Some(min) => min.min(duration_ms),
            None => duration_ms,
        });
        entry.max_duration_ms = Some(match entry.max_duration_ms {
            Some(max) => max.max(duration_ms),
            None => duration_ms,
        });

        if completion.status == ExecutionStatus::Completed {
            entry.successful += 1;
        } else {
            entry.failed += 1;
            let kind = completion
                .error_type
                .clone()
                .unwrap_or_else(|| "internal".to_string());
            *entry.error_types.entry(kind).or_insert(0) += 1;
        }
    }
}

fn snapshot(plugin: &str, live: &PluginRealtime) -> PluginStatsSnapshot {
    PluginStatsSnapshot {
        plugin: plugin.to_string(),
        total: live.total,
        successful: live.successful,
        failed: live.failed,
        avg_duration_ms: if live.total > 0 {
            live.total_duration_ms as f64 / live.total as f64
        } else {
            0.0
        },
        min_duration_ms: live.min_duration_ms,
        max_duration_ms: live.max_duration_ms,
        last_execution: live.last_execution,
        error_types: live.error_types.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tracker() -> Arc<ExecutionTracker> {
        tracker_with(TrackingConfig::default()).await
    }

    async fn tracker_with(config: TrackingConfig) -> Arc<ExecutionTracker> {
        let store = Arc::new(SqliteExecutionStore::initialize_in_memory().await.unwrap());
        Arc::new(ExecutionTracker::new(store, config))
    }

    #[tokio::test]
    async fn begin_complete_satisfies_invariants() {
        let tracker = tracker().await;
        let id = tracker
            .begin("hello", "POST", Some(r#"{"name":"world"}"#), Correlation::default())
            .await
            .unwrap()
            .unwrap();

        tracker
            .complete(&id, Completion::success(Some("ok".to_string())))
            .await
            .unwrap();

        let record = tracker.get(&id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        let end = record.end_time.expect("terminal status carries end_time");
        assert_eq!(
            record.duration_ms.unwrap(),
            (end - record.start_time).num_milliseconds()
        );
        assert_eq!(record.attempts, record.retry_count + 1);
    }

    #[tokio::test]
    async fn begin_truncates_oversize_input() {
        let tracker = tracker_with(TrackingConfig {
            max_input_bytes: 8,
            ..Default::default()
        })
        .await;
        let id = tracker
            .begin("hello", "POST", Some("0123456789abcdef"), Correlation::default())
            .await
            .unwrap()
            .unwrap();

        let record = tracker.get(&id).await.unwrap();
        let input = record.input.unwrap();
        assert!(input.starts_with("01234567"));
        assert!(input.ends_with(crate::storage::TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn disabled_tracking_returns_no_id() {
        let tracker = tracker_with(TrackingConfig {
            enabled: false,
            ..Default::default()
        })
        .await;
        let id = tracker
            .begin("hello", "POST", None, Correlation::default())
            .await
            .unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn failure_completion_updates_error_histogram() {
        let tracker = tracker().await;
        let id = tracker
            .begin("hello", "POST", None, Correlation::default())
            .await
            .unwrap()
            .unwrap();
        tracker
            .complete(&id, Completion::failure("connection refused", "transport"))
            .await
            .unwrap();

        let stats = tracker.plugin_stats("hello").unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_types.get("transport"), Some(&1));
    }

    #[tokio::test]
    async fn realtime_counters_track_durations() {
        let tracker = tracker().await;
        for _ in 0..3 {
            let id = tracker
                .begin("hello", "POST", None, Correlation::default())
                .await
                .unwrap()
                .unwrap();
            tracker
                .complete(&id, Completion::success(None))
                .await
                .unwrap();
        }

        let stats = tracker.plugin_stats("hello").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 3);
        assert!(stats.min_duration_ms.is_some());
        assert!(stats.max_duration_ms.unwrap() >= stats.min_duration_ms.unwrap());
        assert!(stats.last_execution.is_some());

        assert_eq!(tracker.all_plugin_stats().len(), 1);
    }

    #[tokio::test]
    async fn retry_attempt_keeps_attempt_invariant() {
        let tracker = tracker().await;
        let id = tracker
            .begin("hello", "POST", None, Correlation::default())
            .await
            .unwrap()
            .unwrap();

        tracker
            .record_retry_attempt(
                &id,
                ExecutionAttempt {
                    execution_id: id.clone(),
                    attempt_number: 2,
                    start_time: Utc::now(),
                    end_time: Some(Utc::now()),
                    status: ExecutionStatus::Failed,
                    error: Some("transient".to_string()),
                    duration_ms: Some(4),
                },
            )
            .await
            .unwrap();

        let record = tracker.get(&id).await.unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.attempts, record.retry_count + 1);
    }

    #[tokio::test]
    async fn cleanup_delegates_to_store() {
        let tracker = tracker().await;
        // Nothing old enough: sweep deletes zero records.
        let id = tracker
            .begin("hello", "POST", None, Correlation::default())
            .await
            .unwrap()
            .unwrap();
        tracker
            .complete(&id, Completion::success(None))
            .await
            .unwrap();
        assert_eq!(tracker.cleanup().await.unwrap(), 0);
    }
}
