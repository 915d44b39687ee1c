//! # Log Ring
//!
//! Bounded in-memory log buffer with live subscriber fan-out and an
//! append-only file shadow.
//!
//! Appending an entry assigns a strictly monotonic id, trims the ring to
//! its maximum, pushes the entry to every subscriber without blocking
//! (full subscribers drop that entry, the shadow never does), and writes
//! one JSON object per line to the shadow file. On startup the ring is
//! rebuilt from the last `max` lines of the shadow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log shadow i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

/// One entry of the ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Strictly monotonic, unique across the process lifetime.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that produced the entry (`webhook`, `worker`, ...).
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Arbitrary structured payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<LogEntry>,
}

struct RingState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    max: usize,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Bounded log ring with live fan-out and an append-only shadow file.
pub struct LogRing {
    state: Mutex<RingState>,
    shadow: Option<tokio::sync::Mutex<tokio::fs::File>>,
    shadow_path: Option<PathBuf>,
}

impl LogRing {
    /// In-memory only ring.
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                entries: VecDeque::new(),
                next_id: 1,
                max: max.max(1),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            }),
            shadow: None,
            shadow_path: None,
        }
    }

    /// Ring backed by a shadow file. Existing shadow content seeds the
    /// ring with its last `max` entries; unparseable lines are skipped.
    pub async fn with_shadow(max: usize, path: PathBuf) -> Result<Self, LogError> {
        let max = max.max(1);
        let mut entries: VecDeque<LogEntry> = VecDeque::new();
        let mut next_id: u64 = 1;

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => {
                            next_id = next_id.max(entry.id + 1);
                            entries.push_back(entry);
                            if entries.len() > max {
                                entries.pop_front();
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping corrupt log shadow line");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            state: Mutex::new(RingState {
                entries,
                next_id,
                max,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            }),
            shadow: Some(tokio::sync::Mutex::new(file)),
            shadow_path: Some(path),
        })
    }

    /// Append an entry: assign the next id, trim, fan out, shadow.
    pub async fn add(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        plugin: Option<&str>,
        data: Value,
    ) -> LogEntry {
        let entry = {
            let mut state = self.state.lock().expect("log ring mutex poisoned");
            let entry = LogEntry {
                id: state.next_id,
                timestamp: Utc::now(),
                level,
                source: source.to_string(),
                message: message.to_string(),
                plugin: plugin.map(str::to_string),
                data,
            };
            state.next_id += 1;

            state.entries.push_back(entry.clone());
            while state.entries.len() > state.max {
                state.entries.pop_front();
            }

            // Non-blocking fan-out; a full or closed subscriber loses this
            // entry, the ring and shadow never do.
            state
                .subscribers
                .retain(|sub| match sub.sender.try_send(entry.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });

            entry
        };

        if let Some(shadow) = &self.shadow {
            if let Ok(mut line) = serde_json::to_vec(&entry) {
                line.push(b'\n');
                let mut file = shadow.lock().await;
                if let Err(e) = file.write_all(&line).await {
                    tracing::error!(error = %e, "log shadow append failed");
                }
            }
        }

        entry
    }

    /// Register a live subscriber with the given channel capacity.
    pub fn subscribe(&self, capacity: usize) -> (u64, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut state = self.state.lock().expect("log ring mutex poisoned");
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push(Subscriber { id, sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let mut state = self.state.lock().expect("log ring mutex poisoned");
        state.subscribers.retain(|sub| sub.id != subscriber_id);
    }

    /// Entries matching the filter, newest first.
    pub fn filter(
        &self,
        min_level: Option<LogLevel>,
        plugin: Option<&str>,
        limit: usize,
    ) -> Vec<LogEntry> {
        let state = self.state.lock().expect("log ring mutex poisoned");
        state
            .entries
            .iter()
            .rev()
            .filter(|entry| {
                min_level.is_none_or(|min| entry.level.rank() >= min.rank())
                    && plugin.is_none_or(|p| entry.plugin.as_deref() == Some(p))
            })
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("log ring mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shadow_path(&self) -> Option<&PathBuf> {
        self.shadow_path.as_ref()
    }

    /// Flush the shadow file to disk. Called once on graceful shutdown.
    pub async fn flush(&self) -> Result<(), LogError> {
        if let Some(shadow) = &self.shadow {
            let mut file = shadow.lock().await;
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_strictly_monotonic() {
        let ring = LogRing::new(100);
        let mut last = 0;
        for i in 0..10 {
            let entry = ring
                .add(LogLevel::Info, "test", &format!("entry {i}"), None, Value::Null)
                .await;
            assert!(entry.id > last);
            last = entry.id;
        }
    }

    #[tokio::test]
    async fn ring_trims_to_max() {
        let ring = LogRing::new(3);
        for i in 0..10 {
            ring.add(LogLevel::Info, "test", &format!("entry {i}"), None, Value::Null)
                .await;
        }
        assert_eq!(ring.len(), 3);
        let newest = ring.filter(None, None, 10);
        assert_eq!(newest[0].message, "entry 9");
        assert_eq!(newest[2].message, "entry 7");
    }

    #[tokio::test]
    async fn filter_by_level_and_plugin() {
        let ring = LogRing::new(100);
        ring.add(LogLevel::Debug, "test", "noise", None, Value::Null).await;
        ring.add(LogLevel::Error, "test", "boom", Some("hello"), Value::Null)
            .await;
        ring.add(LogLevel::Info, "test", "other plugin", Some("bye"), Value::Null)
            .await;

        let errors = ring.filter(Some(LogLevel::Warn), None, 10);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");

        let hello = ring.filter(None, Some("hello"), 10);
        assert_eq!(hello.len(), 1);

        let limited = ring.filter(None, None, 2);
        assert_eq!(limited.len(), 2);
        // Reverse chronological: newest first.
        assert_eq!(limited[0].message, "other plugin");
    }

    #[tokio::test]
    async fn subscriber_receives_entries_in_order() {
        let ring = LogRing::new(100);
        let (sub_id, mut rx) = ring.subscribe(16);

        for i in 0..5 {
            ring.add(LogLevel::Info, "test", &format!("entry {i}"), None, Value::Null)
                .await;
        }
        for i in 0..5 {
            let entry = rx.recv().await.unwrap();
            assert_eq!(entry.message, format!("entry {i}"));
        }

        // Disconnect; subsequent adds must not block and must prune the
        // dead subscriber.
        drop(rx);
        ring.add(LogLevel::Info, "test", "after disconnect", None, Value::Null)
            .await;
        ring.unsubscribe(sub_id);
    }

    #[tokio::test]
    async fn full_subscriber_drops_entry_but_ring_keeps_it() {
        let ring = LogRing::new(100);
        let (_sub, mut rx) = ring.subscribe(1);

        ring.add(LogLevel::Info, "test", "first", None, Value::Null).await;
        ring.add(LogLevel::Info, "test", "second", None, Value::Null).await;

        // Channel capacity 1: only the first made it through.
        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
        assert_eq!(ring.len(), 2);
    }

    #[tokio::test]
    async fn shadow_reload_reproduces_last_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.log.jsonl");

        let before: Vec<LogEntry> = {
            let ring = LogRing::with_shadow(3, path.clone()).await.unwrap();
            for i in 0..7 {
                ring.add(
                    LogLevel::Info,
                    "test",
                    &format!("entry {i}"),
                    Some("hello"),
                    serde_json::json!({"i": i}),
                )
                .await;
            }
            ring.flush().await.unwrap();
            ring.filter(None, None, 10)
        };

        let ring = LogRing::with_shadow(3, path).await.unwrap();
        let after = ring.filter(None, None, 10);
        assert_eq!(before, after);

        // Ids continue past the reloaded ones.
        let next = ring
            .add(LogLevel::Info, "test", "entry 7", None, Value::Null)
            .await;
        assert_eq!(next.id, 8);
    }

    #[tokio::test]
    async fn shadow_reload_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.log.jsonl");
        tokio::fs::write(
            &path,
            "{\"id\":1,\"timestamp\":\"2026-01-01T00:00:00Z\",\"level\":\"info\",\"source\":\"t\",\"message\":\"ok\"}\nnot json\n",
        )
        .await
        .unwrap();

        let ring = LogRing::with_shadow(10, path).await.unwrap();
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn level_parsing() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("nope"), None);
    }
}
