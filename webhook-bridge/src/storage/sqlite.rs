//! SQLite implementation of the execution store.
//!
//! One database file, WAL journaling and foreign keys enabled through the
//! connection options, a small bounded pool (SQLite favours few
//! connections). All timestamps are stored as RFC 3339 text, durations as
//! integer milliseconds.

use super::migrations;
use super::{
    DailyBreakdown, ExecutionAttempt, ExecutionFilter, ExecutionRecord, ExecutionStats,
    ExecutionStatus, ExecutionUpdate, StatsFilter, StorageError, StorageInfo,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Connection settings for [`SqliteExecutionStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub wal: bool,
    pub foreign_keys: bool,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("webhook_bridge.db"),
            max_connections: 4,
            wal: true,
            foreign_keys: true,
        }
    }
}

/// Execution store backed by an embedded SQLite database.
pub struct SqliteExecutionStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteExecutionStore {
    /// Open (creating if missing) and migrate the database.
    pub async fn initialize(config: &SqliteStoreConfig) -> Result<Self, StorageError> {
        let path_str = config.path.to_string_lossy();
        let mut opts = SqliteConnectOptions::from_str(&path_str)
            .map_err(|e| StorageError::Config {
                message: format!("invalid sqlite path {path_str}: {e}"),
            })?
            .create_if_missing(true)
            .foreign_keys(config.foreign_keys)
            .busy_timeout(Duration::from_secs(5));
        if config.wal {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(0)
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await?;

        migrations::migrate(&pool).await?;

        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn initialize_in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Config {
                message: e.to_string(),
            })?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        migrations::migrate(&pool).await?;
        Ok(Self {
            pool,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Insert a new record. Called exactly once per execution, with a
    /// non-terminal status; completion goes through [`Self::update`].
    pub async fn save(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO executions (
                id, plugin_name, http_method, start_time, end_time, status,
                input, output, error, error_type, duration_ms,
                attempts, retry_count, trace_id, user_agent, remote_ip,
                tags, metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.plugin_name)
        .bind(&record.http_method)
        .bind(record.start_time.to_rfc3339())
        .bind(record.end_time.map(|t| t.to_rfc3339()))
        .bind(record.status.as_str())
        .bind(&record.input)
        .bind(&record.output)
        .bind(&record.error)
        .bind(&record.error_type)
        .bind(record.duration_ms)
        .bind(record.attempts)
        .bind(record.retry_count)
        .bind(&record.trace_id)
        .bind(&record.user_agent)
        .bind(&record.remote_ip)
        .bind(serde_json::to_string(&record.tags).unwrap_or_else(|_| "{}".to_string()))
        .bind(serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one record by id.
    pub async fn get(&self, id: &str) -> Result<ExecutionRecord, StorageError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_record(&row),
            None => Err(StorageError::NotFound { id: id.to_string() }),
        }
    }

    /// Apply completion columns to an existing record in one write.
    ///
    /// When the update carries a terminal status the matching daily
    /// aggregate row is folded in the same call.
    pub async fn update(&self, id: &str, update: &ExecutionUpdate) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE executions SET
                status      = COALESCE(?, status),
                end_time    = COALESCE(?, end_time),
                duration_ms = COALESCE(?, duration_ms),
                output      = COALESCE(?, output),
                error       = COALESCE(?, error),
                error_type  = COALESCE(?, error_type),
                attempts    = COALESCE(?, attempts),
                retry_count = COALESCE(?, retry_count),
                updated_at  = ?
            WHERE id = ?",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.end_time.map(|t| t.to_rfc3339()))
        .bind(update.duration_ms)
        .bind(&update.output)
        .bind(&update.error)
        .bind(&update.error_type)
        .bind(update.attempts)
        .bind(update.retry_count)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { id: id.to_string() });
        }

        if update.status.is_some_and(|s| s.is_terminal()) {
            self.fold_daily_stats(id).await?;
        }
        Ok(())
    }

    /// Delete one record (attempt rows cascade).
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// List records matching the filter, newest start first.
    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut sql = String::from("SELECT * FROM executions WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(plugin) = &filter.plugin_name {
            sql.push_str(" AND plugin_name = ?");
            binds.push(plugin.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(after) = filter.start_after {
            sql.push_str(" AND start_time >= ?");
            binds.push(after.to_rfc3339());
        }
        if let Some(before) = filter.start_before {
            sql.push_str(" AND start_time <= ?");
            binds.push(before.to_rfc3339());
        }
        if let Some(trace_id) = &filter.trace_id {
            sql.push_str(" AND trace_id = ?");
            binds.push(trace_id.clone());
        }
        if let Some(error_type) = &filter.error_type {
            sql.push_str(" AND error_type = ?");
            binds.push(error_type.clone());
        }

        sql.push_str(" ORDER BY start_time DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        query = query
            .bind(filter.limit.unwrap_or(100).clamp(1, 1000))
            .bind(filter.offset.unwrap_or(0).max(0));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Aggregated statistics over the last `filter.days` days.
    pub async fn stats(&self, filter: &StatsFilter) -> Result<ExecutionStats, StorageError> {
        let window_start = Utc::now() - ChronoDuration::days(filter.days.max(0));
        let window_rfc = window_start.to_rfc3339();

        let mut sql = String::from(
            "SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'failed'    THEN 1 ELSE 0 END) AS failed,
                SUM(CASE WHEN status = 'timeout'   THEN 1 ELSE 0 END) AS timeout,
                SUM(CASE WHEN status = 'pending'   THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'running'   THEN 1 ELSE 0 END) AS running,
                AVG(duration_ms) AS avg_duration_ms,
                MIN(duration_ms) AS min_duration_ms,
                MAX(duration_ms) AS max_duration_ms,
                COUNT(DISTINCT plugin_name) AS unique_plugins
            FROM executions WHERE start_time >= ?",
        );
        if filter.plugin_name.is_some() {
            sql.push_str(" AND plugin_name = ?");
        }

        let mut query = sqlx::query(&sql).bind(&window_rfc);
        if let Some(plugin) = &filter.plugin_name {
            query = query.bind(plugin);
        }
        let row = query.fetch_one(&self.pool).await?;

        let completed: i64 = row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0);
        let failed: i64 = row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0);
        let timeout: i64 = row.try_get::<Option<i64>, _>("timeout")?.unwrap_or(0);
        let finished = completed + failed + timeout;

        let mut stats = ExecutionStats {
            total: row.try_get("total")?,
            completed,
            failed,
            timeout,
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            running: row.try_get::<Option<i64>, _>("running")?.unwrap_or(0),
            avg_duration_ms: row
                .try_get::<Option<f64>, _>("avg_duration_ms")?
                .unwrap_or(0.0),
            min_duration_ms: row.try_get("min_duration_ms")?,
            max_duration_ms: row.try_get("max_duration_ms")?,
            unique_plugins: row.try_get("unique_plugins")?,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64
            } else {
                0.0
            },
            per_day: Vec::new(),
        };

        let window_date = window_start.format("%Y-%m-%d").to_string();
        let mut sql = String::from(
            "SELECT date,
                SUM(total) AS total,
                SUM(completed) AS completed,
                SUM(failed) AS failed,
                SUM(timeout) AS timeout,
                SUM(total_duration_ms) AS total_duration_ms
            FROM daily_stats WHERE date >= ?",
        );
        if filter.plugin_name.is_some() {
            sql.push_str(" AND plugin_name = ?");
        }
        sql.push_str(" GROUP BY date ORDER BY date");

        let mut query = sqlx::query(&sql).bind(&window_date);
        if let Some(plugin) = &filter.plugin_name {
            query = query.bind(plugin);
        }
        for row in query.fetch_all(&self.pool).await? {
            let total: i64 = row.try_get::<Option<i64>, _>("total")?.unwrap_or(0);
            let total_duration: i64 = row
                .try_get::<Option<i64>, _>("total_duration_ms")?
                .unwrap_or(0);
            stats.per_day.push(DailyBreakdown {
                date: row.try_get("date")?,
                total,
                completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
                failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
                timeout: row.try_get::<Option<i64>, _>("timeout")?.unwrap_or(0),
                avg_duration_ms: if total > 0 {
                    total_duration as f64 / total as f64
                } else {
                    0.0
                },
            });
        }

        Ok(stats)
    }

    /// Delete records created more than `days` days ago.
    ///
    /// Selection is by `created_at` only, and records still `pending` or
    /// `running` are never deleted. Returns the number of records removed.
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64, StorageError> {
        let cutoff = (Utc::now() - ChronoDuration::days(days.max(0))).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM executions
             WHERE created_at < ? AND status NOT IN ('pending', 'running')",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Insert a per-attempt row under a parent record.
    pub async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO execution_attempts (
                execution_id, attempt_number, start_time, end_time, status, error, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.execution_id)
        .bind(attempt.attempt_number)
        .bind(attempt.start_time.to_rfc3339())
        .bind(attempt.end_time.map(|t| t.to_rfc3339()))
        .bind(attempt.status.as_str())
        .bind(&attempt.error)
        .bind(attempt.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempt rows for one execution, in attempt order.
    pub async fn list_attempts(&self, execution_id: &str) -> Result<Vec<ExecutionAttempt>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_attempts WHERE execution_id = ? ORDER BY attempt_number",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExecutionAttempt {
                    execution_id: row.try_get("execution_id")?,
                    attempt_number: row.try_get("attempt_number")?,
                    start_time: parse_time(&row.try_get::<String, _>("start_time")?)?,
                    end_time: row
                        .try_get::<Option<String>, _>("end_time")?
                        .map(|t| parse_time(&t))
                        .transpose()?,
                    status: parse_status(&row.try_get::<String, _>("status")?)?,
                    error: row.try_get("error")?,
                    duration_ms: row.try_get("duration_ms")?,
                })
            })
            .collect()
    }

    /// Operational info for the admin API.
    pub async fn info(&self) -> Result<StorageInfo, StorageError> {
        let execution_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions")
            .fetch_one(&self.pool)
            .await?;
        let schema_version = migrations::schema_version(&self.pool).await?;
        let size_bytes = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StorageInfo {
            backend: "sqlite".to_string(),
            path: self.path.display().to_string(),
            size_bytes,
            execution_count,
            schema_version,
        })
    }

    /// Cheap liveness probe against the pool.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool. Further calls fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fold a freshly completed record into its daily aggregate row.
    async fn fold_daily_stats(&self, id: &str) -> Result<(), StorageError> {
        let record = self.get(id).await?;
        let date = record.start_time.format("%Y-%m-%d").to_string();
        let duration = record.duration_ms.unwrap_or(0);
        let (completed, failed, timeout) = match record.status {
            ExecutionStatus::Completed => (1, 0, 0),
            ExecutionStatus::Failed => (0, 1, 0),
            ExecutionStatus::Timeout => (0, 0, 1),
            _ => return Ok(()),
        };

        sqlx::query(
            "INSERT INTO daily_stats (
                date, plugin_name, total, completed, failed, timeout,
                total_duration_ms, min_duration_ms, max_duration_ms
            ) VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date, plugin_name) DO UPDATE SET
                total = total + 1,
                completed = completed + excluded.completed,
                failed = failed + excluded.failed,
                timeout = timeout + excluded.timeout,
                total_duration_ms = total_duration_ms + excluded.total_duration_ms,
                min_duration_ms = MIN(COALESCE(min_duration_ms, excluded.min_duration_ms), excluded.min_duration_ms),
                max_duration_ms = MAX(COALESCE(max_duration_ms, excluded.max_duration_ms), excluded.max_duration_ms)",
        )
        .bind(&date)
        .bind(&record.plugin_name)
        .bind(completed)
        .bind(failed)
        .bind(timeout)
        .bind(duration)
        .bind(duration)
        .bind(duration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Config {
            message: format!("corrupt timestamp {value:?}: {e}"),
        })
}

fn parse_status(value: &str) -> Result<ExecutionStatus, StorageError> {
    ExecutionStatus::parse(value).ok_or_else(|| StorageError::Config {
        message: format!("corrupt status {value:?}"),
    })
}

fn parse_kv_json(value: &str) -> HashMap<String, String> {
    serde_json::from_str(value).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> Result<ExecutionRecord, StorageError> {
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        plugin_name: row.try_get("plugin_name")?,
        http_method: row.try_get("http_method")?,
        start_time: parse_time(&row.try_get::<String, _>("start_time")?)?,
        end_time: row
            .try_get::<Option<String>, _>("end_time")?
            .map(|t| parse_time(&t))
            .transpose()?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        error_type: row.try_get("error_type")?,
        duration_ms: row.try_get("duration_ms")?,
        attempts: row.try_get("attempts")?,
        retry_count: row.try_get("retry_count")?,
        trace_id: row.try_get("trace_id")?,
        user_agent: row.try_get("user_agent")?,
        remote_ip: row.try_get("remote_ip")?,
        tags: parse_kv_json(&row.try_get::<String, _>("tags")?),
        metadata: parse_kv_json(&row.try_get::<String, _>("metadata")?),
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteExecutionStore {
        SqliteExecutionStore::initialize_in_memory().await.unwrap()
    }

    fn completed_update(duration_ms: i64) -> ExecutionUpdate {
        let end = Utc::now();
        ExecutionUpdate {
            status: Some(ExecutionStatus::Completed),
            end_time: Some(end),
            duration_ms: Some(duration_ms),
            output: Some("ok".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let store = store().await;
        let mut record = ExecutionRecord::begin("hello", "POST");
        record.input = Some(r#"{"name":"world"}"#.to_string());
        record.trace_id = Some("trace-1".to_string());
        record.tags.insert("env".to_string(), "test".to_string());
        store.save(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap();
        assert_eq!(loaded.plugin_name, "hello");
        assert_eq!(loaded.http_method, "POST");
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.input.as_deref(), Some(r#"{"name":"world"}"#));
        assert_eq!(loaded.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(loaded.tags.get("env").map(String::as_str), Some("test"));
        assert_eq!(loaded.attempts, loaded.retry_count + 1);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let store = store().await;
        let err = store.get("exec_missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn update_sets_completion_columns() {
        let store = store().await;
        let record = ExecutionRecord::begin("hello", "POST");
        store.save(&record).await.unwrap();

        store.update(&record.id, &completed_update(45)).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.duration_ms, Some(45));
        assert!(loaded.end_time.is_some());
        assert!(loaded.end_time.unwrap() >= loaded.start_time);
        assert_eq!(loaded.output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_start_time_desc() {
        let store = store().await;
        for (plugin, offset_s) in [("alpha", 30), ("beta", 20), ("alpha", 10)] {
            let mut record = ExecutionRecord::begin(plugin, "GET");
            record.start_time = Utc::now() - ChronoDuration::seconds(offset_s);
            store.save(&record).await.unwrap();
        }

        let all = store.list(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].start_time >= w[1].start_time));

        let alphas = store
            .list(&ExecutionFilter {
                plugin_name: Some("alpha".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alphas.len(), 2);
        assert!(alphas.iter().all(|r| r.plugin_name == "alpha"));

        let limited = store
            .list(&ExecutionFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_error_type() {
        let store = store().await;
        let ok = ExecutionRecord::begin("hello", "POST");
        store.save(&ok).await.unwrap();
        store.update(&ok.id, &completed_update(5)).await.unwrap();

        let bad = ExecutionRecord::begin("hello", "POST");
        store.save(&bad).await.unwrap();
        store
            .update(
                &bad.id,
                &ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    end_time: Some(Utc::now()),
                    duration_ms: Some(3),
                    error: Some("connection refused".to_string()),
                    error_type: Some("transport".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = store
            .list(&ExecutionFilter {
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad.id);

        let transport = store
            .list(&ExecutionFilter {
                error_type: Some("transport".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(transport.len(), 1);
    }

    #[tokio::test]
    async fn stats_aggregates_window() {
        let store = store().await;
        for duration in [10, 20, 30] {
            let record = ExecutionRecord::begin("hello", "POST");
            store.save(&record).await.unwrap();
            store
                .update(&record.id, &completed_update(duration))
                .await
                .unwrap();
        }
        let bad = ExecutionRecord::begin("other", "GET");
        store.save(&bad).await.unwrap();
        store
            .update(
                &bad.id,
                &ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    end_time: Some(Utc::now()),
                    duration_ms: Some(40),
                    error_type: Some("timeout".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.stats(&StatsFilter::default()).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unique_plugins, 2);
        assert_eq!(stats.min_duration_ms, Some(10));
        assert_eq!(stats.max_duration_ms, Some(40));
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.per_day.len(), 1);
        assert_eq!(stats.per_day[0].total, 4);

        let hello_only = store
            .stats(&StatsFilter {
                days: 7,
                plugin_name: Some("hello".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(hello_only.total, 3);
        assert_eq!(hello_only.failed, 0);
        assert!((hello_only.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cleanup_respects_age_and_running_records() {
        let store = store().await;

        // 40 days old, completed: eligible.
        let mut old_done = ExecutionRecord::begin("hello", "POST");
        old_done.created_at = Utc::now() - ChronoDuration::days(40);
        store.save(&old_done).await.unwrap();
        store.update(&old_done.id, &completed_update(5)).await.unwrap();

        // 40 days old but still running: must survive.
        let mut old_running = ExecutionRecord::begin("hello", "POST");
        old_running.created_at = Utc::now() - ChronoDuration::days(40);
        store.save(&old_running).await.unwrap();

        // 10 days old and fresh records: survive.
        let mut recent = ExecutionRecord::begin("hello", "POST");
        recent.created_at = Utc::now() - ChronoDuration::days(10);
        store.save(&recent).await.unwrap();
        store.update(&recent.id, &completed_update(5)).await.unwrap();

        let fresh = ExecutionRecord::begin("hello", "POST");
        store.save(&fresh).await.unwrap();
        store.update(&fresh.id, &completed_update(5)).await.unwrap();

        let deleted = store.cleanup_older_than(30).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get(&old_done.id).await.is_err());
        assert!(store.get(&old_running.id).await.is_ok());
        assert!(store.get(&recent.id).await.is_ok());
        assert!(store.get(&fresh.id).await.is_ok());
    }

    #[tokio::test]
    async fn attempts_cascade_on_delete() {
        let store = store().await;
        let record = ExecutionRecord::begin("hello", "POST");
        store.save(&record).await.unwrap();

        for attempt_number in 1..=2 {
            store
                .record_attempt(&ExecutionAttempt {
                    execution_id: record.id.clone(),
                    attempt_number,
                    start_time: Utc::now(),
                    end_time: Some(Utc::now()),
                    status: ExecutionStatus::Failed,
                    error: Some("transient".to_string()),
                    duration_ms: Some(3),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list_attempts(&record.id).await.unwrap().len(), 2);

        store.delete(&record.id).await.unwrap();
        assert!(store.list_attempts(&record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn info_reports_counts_and_version() {
        let store = store().await;
        let record = ExecutionRecord::begin("hello", "POST");
        store.save(&record).await.unwrap();

        let info = store.info().await.unwrap();
        assert_eq!(info.backend, "sqlite");
        assert_eq!(info.execution_count, 1);
        assert_eq!(
            info.schema_version,
            migrations::MIGRATIONS.last().unwrap().version
        );
    }

    #[tokio::test]
    async fn health_check_passes_on_open_pool() {
        let store = store().await;
        store.health_check().await.unwrap();
    }
}
