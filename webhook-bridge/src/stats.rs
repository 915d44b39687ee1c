//! # Plugin Statistics Store
//!
//! Per-`plugin:method` counters with crash-safe persistence. One instance
//! serves every reader: `/metrics`, the executions API, and the dashboard
//! read-models all see the same map.
//!
//! Persistence is a whole-map JSON snapshot written atomically: serialise
//! into a uniquely named temp file in the data directory, `fsync`, rename
//! over the target. The previous good file survives as a `.bak` copy and
//! is the fallback at load time. Snapshot requests are coalesced through a
//! capacity-one signal channel drained by a background checkpointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SNAPSHOT_FILE: &str = "plugin_stats.json";
const BACKUP_FILE: &str = "plugin_stats.json.bak";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("stats i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stats serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("stats path rejected: {message}")]
    Path { message: String },
}

/// Counters for one `plugin:method` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MethodStats {
    pub count: u64,
    pub errors: u64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Aggregate totals across all plugins.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsTotals {
    pub requests: u64,
    pub executions: u64,
    pub errors: u64,
}

/// The full persisted state: what the snapshot file contains.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub totals: StatsTotals,
    /// Keyed `plugin:method`.
    pub per_plugin: HashMap<String, MethodStats>,
    pub saved_at: Option<DateTime<Utc>>,
}

/// Plugin statistics with periodic atomic snapshots.
pub struct StatsStore {
    state: RwLock<StatsSnapshot>,
    data_dir: PathBuf,
    dirty_tx: mpsc::Sender<()>,
    dirty_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl StatsStore {
    /// Open the store rooted at `data_dir`, loading the previous snapshot
    /// (primary file first, backup as fallback).
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StatsError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let primary = validated_path(&data_dir, SNAPSHOT_FILE)?;
        let backup = validated_path(&data_dir, BACKUP_FILE)?;

        let snapshot = match load_snapshot(&primary).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => match load_snapshot(&backup).await {
                Ok(Some(snapshot)) => {
                    tracing::warn!("stats snapshot restored from backup copy");
                    snapshot
                }
                _ => StatsSnapshot::default(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "stats snapshot unreadable, trying backup");
                match load_snapshot(&backup).await {
                    Ok(Some(snapshot)) => snapshot,
                    _ => StatsSnapshot::default(),
                }
            }
        };

        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        Ok(Self {
            state: RwLock::new(snapshot),
            data_dir,
            dirty_tx,
            dirty_rx: Mutex::new(Some(dirty_rx)),
        })
    }

    /// Count one HTTP request against the aggregate totals.
    pub async fn record_request(&self) {
        self.state.write().await.totals.requests += 1;
        self.mark_dirty();
    }

    /// Fold one finished execution into the `plugin:method` counters.
    pub async fn record_execution(
        &self,
        plugin: &str,
        method: &str,
        duration_ms: i64,
        success: bool,
    ) {
        let key = stats_key(plugin, method);
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            state.totals.executions += 1;
            if !success {
                state.totals.errors += 1;
            }

            let entry = state.per_plugin.entry(key).or_default();
            entry.count += 1;
            if !success {
                entry.errors += 1;
            }
            entry.total_duration_ms += duration_ms.max(0);
            entry.avg_duration_ms = entry.total_duration_ms as f64 / entry.count as f64;
            entry.last_execution = Some(now);
        }
        self.mark_dirty();
    }

    /// Current counters for one `plugin:method` pair.
    pub async fn method_stats(&self, plugin: &str, method: &str) -> Option<MethodStats> {
        self.state
            .read()
            .await
            .per_plugin
            .get(&stats_key(plugin, method))
            .cloned()
    }

    /// Full snapshot of the in-memory state.
    pub async fn snapshot(&self) -> StatsSnapshot {
        self.state.read().await.clone()
    }

    /// Write the current state to disk atomically, keeping the previous
    /// good file as backup.
    pub async fn save(&self) -> Result<(), StatsError> {
        let snapshot = {
            let mut state = self.state.write().await;
            state.saved_at = Some(Utc::now());
            state.clone()
        };

        let primary = validated_path(&self.data_dir, SNAPSHOT_FILE)?;
        let backup = validated_path(&self.data_dir, BACKUP_FILE)?;
        let temp_name = format!(".{}.{}.tmp", SNAPSHOT_FILE, uuid::Uuid::new_v4().simple());
        let temp = validated_path(&self.data_dir, &temp_name)?;

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if tokio::fs::try_exists(&primary).await? {
            // Best effort: a failed backup rotation must not lose the new
            // snapshot.
            if let Err(e) = tokio::fs::copy(&primary, &backup).await {
                tracing::warn!(error = %e, "stats backup rotation failed");
            }
        }
        tokio::fs::rename(&temp, &primary).await?;
        tracing::debug!(path = %primary.display(), "stats snapshot written");
        Ok(())
    }

    /// Spawn the background checkpointer: saves on coalesced dirty signals
    /// and on a fixed interval, and once more on cancellation.
    pub fn spawn_checkpointer(
        self: &std::sync::Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut dirty_rx = store
                .dirty_rx
                .lock()
                .await
                .take()
                .expect("stats checkpointer started twice");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = store.save().await {
                            tracing::error!(error = %e, "final stats flush failed");
                        }
                        tracing::debug!("stats checkpointer stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            tracing::error!(error = %e, "periodic stats snapshot failed");
                        }
                    }
                    Some(()) = dirty_rx.recv() => {
                        if let Err(e) = store.save().await {
                            tracing::error!(error = %e, "stats snapshot failed");
                        }
                    }
                }
            }
        })
    }

    fn mark_dirty(&self) {
        // Capacity-one channel: while a signal is pending, further writes
        // coalesce into it.
        let _ = self.dirty_tx.try_send(());
    }
}

/// Key for the per-plugin map.
pub fn stats_key(plugin: &str, method: &str) -> String {
    format!("{plugin}:{method}")
}

async fn load_snapshot(path: &Path) -> Result<Option<StatsSnapshot>, StatsError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Join `name` onto `dir`, rejecting anything that would escape it.
fn validated_path(dir: &Path, name: &str) -> Result<PathBuf, StatsError> {
    let candidate = Path::new(name);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes || name.contains('/') || name.contains('\\') {
        return Err(StatsError::Path {
            message: format!("{name:?} escapes the data directory"),
        });
    }
    Ok(dir.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn record_execution_updates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(dir.path()).await.unwrap();

        store.record_execution("hello", "POST", 40, true).await;
        store.record_execution("hello", "POST", 60, true).await;
        store.record_execution("hello", "POST", 20, false).await;

        let stats = store.method_stats("hello", "POST").await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.total_duration_ms, 120);
        assert!((stats.avg_duration_ms - 40.0).abs() < f64::EPSILON);
        assert!(stats.last_execution.is_some());

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.totals.executions, 3);
        assert_eq!(snapshot.totals.errors, 1);
    }

    #[tokio::test]
    async fn snapshot_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let saved = {
            let store = StatsStore::open(dir.path()).await.unwrap();
            store.record_request().await;
            store.record_execution("hello", "POST", 45, true).await;
            store.record_execution("audit", "GET", 5, false).await;
            store.save().await.unwrap();
            store.snapshot().await
        };

        let reloaded = StatsStore::open(dir.path()).await.unwrap();
        assert_eq!(reloaded.snapshot().await, saved);
    }

    #[tokio::test]
    async fn save_keeps_backup_of_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(dir.path()).await.unwrap();

        store.record_execution("hello", "POST", 10, true).await;
        store.save().await.unwrap();
        store.record_execution("hello", "POST", 10, true).await;
        store.save().await.unwrap();

        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        assert!(dir.path().join(BACKUP_FILE).exists());

        // Backup holds the previous generation.
        let backup: StatsSnapshot =
            serde_json::from_slice(&std::fs::read(dir.path().join(BACKUP_FILE)).unwrap()).unwrap();
        assert_eq!(backup.per_plugin[&stats_key("hello", "POST")].count, 1);
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StatsStore::open(dir.path()).await.unwrap();
            store.record_execution("hello", "POST", 10, true).await;
            store.save().await.unwrap();
            store.record_execution("hello", "POST", 10, true).await;
            store.save().await.unwrap();
        }
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"{garbage").unwrap();

        let store = StatsStore::open(dir.path()).await.unwrap();
        let stats = store.method_stats("hello", "POST").await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(dir.path()).await.unwrap();
        store.record_execution("hello", "POST", 10, true).await;
        store.save().await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn checkpointer_flushes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StatsStore::open(dir.path()).await.unwrap());
        let cancel = CancellationToken::new();
        let handle = store.spawn_checkpointer(std::time::Duration::from_secs(3600), cancel.clone());

        store.record_execution("hello", "POST", 45, true).await;
        cancel.cancel();
        handle.await.unwrap();

        let reloaded = StatsStore::open(dir.path()).await.unwrap();
        assert_eq!(reloaded.method_stats("hello", "POST").await.unwrap().count, 1);
    }

    #[test]
    fn path_validation_rejects_traversal() {
        let dir = Path::new("/data");
        assert!(validated_path(dir, "stats.json").is_ok());
        assert!(validated_path(dir, "../stats.json").is_err());
        assert!(validated_path(dir, "/etc/passwd").is_err());
        assert!(validated_path(dir, "a/b.json").is_err());
        assert!(validated_path(dir, "a\\b.json").is_err());
    }
}
