//! # Worker Pool
//!
//! Bounded pool of long-lived tasks consuming a typed job queue. The pool
//! decouples HTTP arrival from plugin invocation: the asynchronous webhook
//! path, batch fan-out, delayed invocations, and manual executor probes
//! all run here.
//!
//! ## Scheduling
//!
//! `N` workers (default four) share one bounded FIFO queue. Submissions
//! that would overflow the queue fail synchronously with
//! [`WorkerError::Backpressure`]; the submitter, not the pool, decides
//! whether to retry.
//!
//! ## Retries
//!
//! A handler failure with a retryable kind re-enqueues the job with a
//! bounded back-off keyed by the attempt number, as long as
//! `attempt <= max_retry + 1`. Non-retryable kinds terminate the job.
//! Webhook jobs keep their execution record across attempts: retries
//! re-open per-attempt rows under the same parent record.
//!
//! ## Shutdown
//!
//! Cancelling the pool token stops intake, signals in-flight handlers,
//! and drains queued jobs to `failed` with the `shutdown` error kind.

use crate::bridge_error::kind;
use crate::tracker::{Completion, Correlation, ExecutionTracker};
use async_trait::async_trait;
use chrono::Utc;
use executor_sdk::{ExecutePluginRequest, ExecutorClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pool sizing, from the `workers` config group.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub queue_capacity: usize,
    pub default_max_retry: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            queue_capacity: 256,
            default_max_retry: 0,
        }
    }
}

/// One unit of asynchronous work. Lives only while enqueued or running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    /// Handler-specific payload; handlers may stash state here between
    /// retry attempts (e.g. the execution record id).
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retry: u32,
    /// 1-based; incremented by the pool before each re-enqueue.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub submitted_at: chrono::DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl Job {
    pub fn new(job_type: &str, payload: Value) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            job_type: job_type.to_string(),
            payload,
            priority: 0,
            max_retry: 0,
            attempt: 1,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }
}

/// Errors surfaced to job submitters.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The queue is full; the caller may retry later.
    #[error("worker queue full")]
    Backpressure,

    /// The pool is stopped; no further jobs are accepted.
    #[error("worker pool is shut down")]
    Shutdown,

    /// No handler registered for the job type.
    #[error("unknown job type: {0}")]
    UnknownType(String),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Backpressure => kind::BACKPRESSURE,
            WorkerError::Shutdown => kind::SHUTDOWN,
            WorkerError::UnknownType(_) => kind::INVALID_ARGUMENT,
        }
    }
}

/// Failure returned by a job handler.
#[derive(Debug)]
pub struct JobError {
    pub message: String,
    /// Bridge-wide error kind string.
    pub kind: String,
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>, kind: &str) -> Self {
        Self {
            message: message.into(),
            kind: kind.to_string(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>, kind: &str) -> Self {
        Self {
            message: message.into(),
            kind: kind.to_string(),
            retryable: false,
        }
    }
}

/// Handler for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The `type` string this handler registers for.
    fn job_type(&self) -> &'static str;

    /// Process one job. The payload is mutable so handlers can persist
    /// state across retry attempts. Handlers must observe `cancel`
    /// promptly during long waits.
    async fn handle(&self, job: &mut Job, cancel: &CancellationToken) -> Result<Value, JobError>;
}

/// Pool counters surfaced by `/workers` and `/metrics`.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub submitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub queue_depth: AtomicUsize,
    pub busy_workers: AtomicUsize,
}

/// Serialisable snapshot of [`PoolCounters`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
}

/// The worker pool. Construct, register handlers, then [`WorkerPool::start`].
pub struct WorkerPool {
    config: WorkerConfig,
    tx: mpsc::Sender<Job>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Mutex::new(HashMap::new()),
            counters: Arc::new(PoolCounters::default()),
            cancel,
        }
    }

    /// Register a handler. Later registrations for the same type replace
    /// earlier ones; call before [`Self::start`].
    pub async fn register(&self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .lock()
            .await
            .insert(handler.job_type().to_string(), handler);
    }

    /// Submit a job.
    ///
    /// Fails synchronously with [`WorkerError::Backpressure`] when the
    /// queue is at capacity and [`WorkerError::UnknownType`] when no
    /// handler is registered for the type.
    pub async fn submit(&self, job: Job) -> Result<String, WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::Shutdown);
        }
        if !self.handlers.lock().await.contains_key(&job.job_type) {
            return Err(WorkerError::UnknownType(job.job_type));
        }

        let id = job.id.clone();
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(WorkerError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Shutdown),
        }
    }

    /// Spawn the worker tasks. Returns their join handles.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("worker pool started twice");
        let rx = Arc::new(Mutex::new(rx));
        let handlers = Arc::new(self.handlers.lock().await.clone());

        (0..self.config.count.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let handlers = Arc::clone(&handlers);
                let counters = Arc::clone(&self.counters);
                let tx = self.tx.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, rx, handlers, counters, tx, cancel).await;
                })
            })
            .collect()
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.config.count,
            queue_capacity: self.config.queue_capacity,
            queue_depth: self.counters.queue_depth.load(Ordering::Relaxed),
            busy_workers: self.counters.busy_workers.load(Ordering::Relaxed),
            jobs_submitted: self.counters.submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }

    pub fn default_max_retry(&self) -> u32 {
        self.config.default_max_retry
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
    counters: Arc<PoolCounters>,
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain: everything still queued fails with `shutdown`.
                    while let Ok(job) = rx.try_recv() {
                        counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(job_id = %job.id, job_type = %job.job_type,
                            "job cancelled during shutdown drain");
                    }
                    tracing::debug!(worker_id, "worker stopped");
                    return;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            }
        };
        counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
        counters.busy_workers.fetch_add(1, Ordering::Relaxed);

        let mut job = job;
        let result = match handlers.get(&job.job_type) {
            Some(handler) => handler.handle(&mut job, &cancel).await,
            None => Err(JobError::fatal(
                format!("no handler for job type {}", job.job_type),
                kind::INTERNAL,
            )),
        };

        match result {
            Ok(_) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %job.id, job_type = %job.job_type,
                    attempt = job.attempt, "job completed");
            }
            Err(err) if err.retryable && job.attempt <= job.max_retry => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
                let delay = retry_backoff(job.attempt);
                tracing::warn!(job_id = %job.id, job_type = %job.job_type,
                    attempt = job.attempt, error = %err.message, delay_ms = delay.as_millis() as u64,
                    "job failed, re-enqueueing");

                job.attempt += 1;
                let tx = tx.clone();
                let counters = Arc::clone(&counters);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                        }
                        _ = tokio::time::sleep(delay) => {
                            match tx.try_send(job) {
                                Ok(()) => {
                                    counters.queue_depth.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    counters.failed.fetch_add(1, Ordering::Relaxed);
                                    tracing::error!(error = %e, "retry re-enqueue failed");
                                }
                            }
                        }
                    }
                });
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job_id = %job.id, job_type = %job.job_type,
                    attempt = job.attempt, kind = %err.kind, error = %err.message, "job failed");
            }
        }

        counters.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded back-off keyed by attempt number: 500ms * 2^(n-1), capped at 10s.
fn retry_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    std::cmp::min(
        Duration::from_millis(500).saturating_mul(1 << exp),
        Duration::from_secs(10),
    )
}

// ---------------------------------------------------------------------------
// Job handlers
// ---------------------------------------------------------------------------

/// `webhook` jobs: invoke a plugin through the tracker, exactly like the
/// synchronous HTTP path but off the request thread.
pub struct WebhookJobHandler {
    client: Arc<ExecutorClient>,
    tracker: Arc<ExecutionTracker>,
    timeout: Duration,
}

impl WebhookJobHandler {
    pub fn new(
        client: Arc<ExecutorClient>,
        tracker: Arc<ExecutionTracker>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            tracker,
            timeout,
        }
    }

    /// Run one plugin invocation for `job`, tracking it under a single
    /// parent record across attempts.
    async fn invoke(&self, job: &mut Job) -> Result<Value, JobError> {
        let plugin = job
            .payload
            .get("plugin")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::fatal("webhook job missing plugin", kind::INVALID_ARGUMENT))?
            .to_string();
        let method = job
            .payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_string();
        let data: HashMap<String, String> = job
            .payload
            .get("data")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), value_to_text(v)))
                    .collect()
            })
            .unwrap_or_default();

        // First attempt opens the parent record; retries reuse it through
        // per-attempt rows.
        let record_id = match job.payload.get("record_id").and_then(Value::as_str) {
            Some(id) => Some(id.to_string()),
            None => {
                let input = serde_json::to_string(&data).ok();
                let id = self
                    .tracker
                    .begin(&plugin, &method, input.as_deref(), Correlation::default())
                    .await
                    .map_err(|e| JobError::fatal(e.to_string(), kind::STORAGE))?;
                if let Some(id) = &id {
                    job.payload["record_id"] = Value::String(id.clone());
                }
                id
            }
        };

        let attempt_start = Utc::now();

        // Re-opened attempt: a per-attempt row under the same parent, and
        // the parent's counters move with it (attempts = retry_count + 1).
        if job.attempt > 1 {
            if let Some(id) = &record_id {
                self.tracker
                    .record_retry_attempt(
                        id,
                        crate::storage::ExecutionAttempt {
                            execution_id: id.clone(),
                            attempt_number: job.attempt as i64,
                            start_time: attempt_start,
                            end_time: None,
                            status: crate::storage::ExecutionStatus::Running,
                            error: None,
                            duration_ms: None,
                        },
                    )
                    .await
                    .map_err(|e| JobError::fatal(e.to_string(), kind::STORAGE))?;
            }
        }

        let result = self
            .client
            .execute_plugin(
                ExecutePluginRequest {
                    name: plugin.clone(),
                    http_method: method.clone(),
                    data,
                },
                self.timeout,
            )
            .await;

        match result {
            Ok(response) if !response.is_error() => {
                if let Some(id) = &record_id {
                    let output = serde_json::to_string(&response.data).ok();
                    self.tracker
                        .complete(id, Completion::success(output))
                        .await
                        .map_err(|e| JobError::fatal(e.to_string(), kind::STORAGE))?;
                }
                Ok(serde_json::json!({
                    "plugin": plugin,
                    "status_code": if response.status_code == 0 { 200 } else { response.status_code },
                    "execution_time_ms": response.execution_time_ms(),
                }))
            }
            Ok(response) => {
                if let Some(id) = &record_id {
                    self.tracker
                        .complete(
                            id,
                            Completion::failure(response.error.clone(), kind::PLUGIN_RUNTIME),
                        )
                        .await
                        .map_err(|e| JobError::fatal(e.to_string(), kind::STORAGE))?;
                }
                Err(JobError::fatal(response.error, kind::PLUGIN_RUNTIME))
            }
            Err(e) => {
                let err_kind = e.kind();
                let retryable = e.is_retryable() && job.attempt <= job.max_retry;
                if let Some(id) = &record_id {
                    if retryable {
                        // Not final: keep the parent open, close this attempt.
                        let now = Utc::now();
                        self.tracker
                            .record_retry_attempt(
                                id,
                                crate::storage::ExecutionAttempt {
                                    execution_id: id.clone(),
                                    attempt_number: job.attempt as i64,
                                    start_time: attempt_start,
                                    end_time: Some(now),
                                    status: crate::storage::ExecutionStatus::Failed,
                                    error: Some(e.to_string()),
                                    duration_ms: Some(
                                        (now - attempt_start).num_milliseconds().max(0),
                                    ),
                                },
                            )
                            .await
                            .map_err(|te| JobError::fatal(te.to_string(), kind::STORAGE))?;
                    } else {
                        let completion = if err_kind == kind::TIMEOUT {
                            Completion::timeout(e.to_string())
                        } else {
                            Completion::failure(e.to_string(), err_kind)
                        };
                        self.tracker
                            .complete(id, completion)
                            .await
                            .map_err(|te| JobError::fatal(te.to_string(), kind::STORAGE))?;
                    }
                }
                Err(JobError {
                    message: e.to_string(),
                    kind: err_kind.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        }
    }
}

#[async_trait]
impl JobHandler for WebhookJobHandler {
    fn job_type(&self) -> &'static str {
        "webhook"
    }

    async fn handle(&self, job: &mut Job, _cancel: &CancellationToken) -> Result<Value, JobError> {
        self.invoke(job).await
    }
}

/// `batch` jobs: fan a list of webhook sub-jobs out and collect results.
pub struct BatchJobHandler {
    webhook: Arc<WebhookJobHandler>,
}

impl BatchJobHandler {
    pub fn new(webhook: Arc<WebhookJobHandler>) -> Self {
        Self { webhook }
    }
}

#[async_trait]
impl JobHandler for BatchJobHandler {
    fn job_type(&self) -> &'static str {
        "batch"
    }

    async fn handle(&self, job: &mut Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let jobs = job
            .payload
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| JobError::fatal("batch job missing jobs array", kind::INVALID_ARGUMENT))?;

        let mut results = Vec::with_capacity(jobs.len());
        for (index, payload) in jobs.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(JobError::fatal("batch cancelled", kind::SHUTDOWN));
            }
            let mut sub = Job::new("webhook", payload);
            sub.max_retry = job.max_retry;
            match self.webhook.invoke(&mut sub).await {
                Ok(result) => results.push(serde_json::json!({
                    "index": index,
                    "ok": true,
                    "result": result,
                })),
                Err(e) => results.push(serde_json::json!({
                    "index": index,
                    "ok": false,
                    "error": e.message,
                    "error_type": e.kind,
                })),
            }
        }
        Ok(Value::Array(results))
    }
}

/// `scheduled` jobs: delayed webhook invocation.
pub struct ScheduledJobHandler {
    webhook: Arc<WebhookJobHandler>,
}

impl ScheduledJobHandler {
    pub fn new(webhook: Arc<WebhookJobHandler>) -> Self {
        Self { webhook }
    }
}

#[async_trait]
impl JobHandler for ScheduledJobHandler {
    fn job_type(&self) -> &'static str {
        "scheduled"
    }

    async fn handle(&self, job: &mut Job, cancel: &CancellationToken) -> Result<Value, JobError> {
        let delay_s = job
            .payload
            .get("delay_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if delay_s > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(JobError::fatal("scheduled job cancelled", kind::SHUTDOWN));
                }
                _ = tokio::time::sleep(Duration::from_secs(delay_s)) => {}
            }
        }
        self.webhook.invoke(job).await
    }
}

/// `health_check` jobs: one liveness probe against the executor.
pub struct HealthCheckJobHandler {
    client: Arc<ExecutorClient>,
}

impl HealthCheckJobHandler {
    pub fn new(client: Arc<ExecutorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for HealthCheckJobHandler {
    fn job_type(&self) -> &'static str {
        "health_check"
    }

    async fn handle(&self, _job: &mut Job, _cancel: &CancellationToken) -> Result<Value, JobError> {
        match self.client.health_check("").await {
            Ok(resp) => Ok(serde_json::json!({
                "healthy": resp.healthy,
                "message": resp.message,
            })),
            Err(e) => Err(JobError {
                message: e.to_string(),
                kind: e.kind().to_string(),
                retryable: e.is_retryable(),
            }),
        }
    }
}

/// Textual representation of a JSON value, matching the webhook payload
/// normalisation of the HTTP layer.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
