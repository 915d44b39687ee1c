//! # HTTP Metrics
//!
//! Atomic request counters for the `/metrics` endpoint. Lock-free by
//! design: the metrics middleware touches these on every request, so each
//! counter is a plain atomic and aggregation happens at read time.
//!
//! One instance lives in the application state (explicit injection, no
//! globals) next to the execution counters owned by the tracker and the
//! persisted per-plugin stats owned by [`crate::stats::StatsStore`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free HTTP counters.
#[derive(Debug)]
pub struct HttpMetrics {
    started_at: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
    total_latency_micros: AtomicU64,
    status_2xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
}

impl HttpMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_latency_micros: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
        }
    }

    /// Record one finished request.
    pub fn record(&self, status: u16, latency_micros: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        match status {
            200..=299 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.status_5xx.fetch_add(1, Ordering::Relaxed)
            }
            _ => 0,
        };
        if (400..500).contains(&status) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_micros.load(Ordering::Relaxed);
        HttpMetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            total_requests: requests,
            total_errors: self.errors.load(Ordering::Relaxed),
            avg_latency_ms: if requests > 0 {
                total_latency as f64 / requests as f64 / 1000.0
            } else {
                0.0
            },
            status_2xx: self.status_2xx.load(Ordering::Relaxed),
            status_4xx: self.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.status_5xx.load(Ordering::Relaxed),
        }
    }
}

impl Default for HttpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable view of [`HttpMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct HttpMetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_classifies_statuses() {
        let metrics = HttpMetrics::new();
        metrics.record(200, 1000);
        metrics.record(204, 1000);
        metrics.record(404, 2000);
        metrics.record(500, 4000);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 4);
        assert_eq!(snap.status_2xx, 2);
        assert_eq!(snap.status_4xx, 1);
        assert_eq!(snap.status_5xx, 1);
        assert_eq!(snap.total_errors, 2);
        assert!((snap.avg_latency_ms - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_metrics_have_zero_latency() {
        let snap = HttpMetrics::new().snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }
}
