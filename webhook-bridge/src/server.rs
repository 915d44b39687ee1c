//! # HTTP Server
//!
//! Component wiring and the axum router. Everything is injected through
//! [`AppState`] at process start; components never reach for globals,
//! and the dependency direction is strictly HTTP → {tracker, pool,
//! client, logs, stats} → store.
//!
//! ## Middleware stack (outermost first)
//!
//! recovery → compression → cache directives (+ timeout hint) → security
//! headers → CORS → logger → request-id → metrics → rate limiting
//! (release mode only).
//!
//! ## Shutdown
//!
//! On SIGINT/SIGTERM the server stops accepting connections and gives
//! in-flight requests up to 30 seconds, then the process-wide token
//! cancels the worker pool, health prober, retention sweep, and stats
//! checkpointer; the stats map is flushed once more, the log shadow is
//! synced, the executor client and the store are closed.

use crate::config::BridgeConfig;
use crate::handlers;
use crate::logs::LogRing;
use crate::metrics::HttpMetrics;
use crate::middleware::{
    cache_directives_middleware, cors_layer, logging_middleware, metrics_middleware,
    rate_limit_middleware, recovery_response, request_id_middleware, security_headers_middleware,
    RateLimiter,
};
use crate::stats::StatsStore;
use crate::storage::sqlite::SqliteStoreConfig;
use crate::storage::SqliteExecutionStore;
use crate::tracker::{ExecutionTracker, TrackingConfig};
use crate::worker::{
    BatchJobHandler, HealthCheckJobHandler, JobHandler, ScheduledJobHandler, WebhookJobHandler,
    WorkerConfig, WorkerPool,
};
use crate::dashboard;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use executor_sdk::{ExecutorClient, ExecutorConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;

/// Requests in flight get this long to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Release-mode request budget per client per minute.
const RATE_LIMIT_PER_MINUTE: u32 = 600;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub client: Arc<ExecutorClient>,
    pub tracker: Arc<ExecutionTracker>,
    pub pool: Arc<WorkerPool>,
    pub logs: Arc<LogRing>,
    pub stats: Arc<StatsStore>,
    pub http_metrics: Arc<HttpMetrics>,
    pub rate_limiter: Arc<RateLimiter>,
    pub shutdown: CancellationToken,
}

/// Handles the server loop holds onto for the shutdown sequence.
pub struct Background {
    pub store: Arc<SqliteExecutionStore>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Construct every component and wire them together.
pub async fn build_state(
    config: BridgeConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<(AppState, Background)> {
    let config = Arc::new(config);

    // Executor client (C1) and its periodic health probe.
    let client = Arc::new(ExecutorClient::new(
        ExecutorConfig::new(config.executor.base_url()).with_timeout(config.executor.timeout()),
    )?);
    let prober = client.spawn_health_prober(config.executor.health_interval(), shutdown.clone());

    // Execution store (C2) and tracker (C3).
    let store = Arc::new(
        SqliteExecutionStore::initialize(&SqliteStoreConfig {
            path: config.sqlite_path(),
            max_connections: config.storage.sqlite.max_connections,
            wal: config.storage.sqlite.wal,
            foreign_keys: config.storage.sqlite.foreign_keys,
        })
        .await?,
    );
    let tracker = Arc::new(ExecutionTracker::new(
        Arc::clone(&store),
        TrackingConfig {
            enabled: config.tracking.enabled,
            fail_requests_on_storage_error: config.tracking.fail_requests_on_storage_error,
            max_input_bytes: config.tracking.max_input_bytes,
            max_output_bytes: config.tracking.max_output_bytes,
            cleanup_interval: Duration::from_secs(config.tracking.cleanup_interval_s.max(1)),
            retention_days: config.storage.retention_days,
        },
    ));
    let retention = tracker.spawn_retention_worker(shutdown.clone());

    // Log ring (C5) with its shadow file.
    let logs = Arc::new(
        LogRing::with_shadow(config.logging.max_ring_size, config.log_shadow_path()).await?,
    );

    // Plugin statistics (C5); one instance serves every reader.
    let stats = Arc::new(StatsStore::open(config.data_dir()).await?);
    let checkpointer = stats.spawn_checkpointer(
        Duration::from_secs(config.tracking.stats_flush_interval_s.max(1)),
        shutdown.clone(),
    );

    // Worker pool (C4) with the standard handler set.
    let pool = Arc::new(WorkerPool::new(
        WorkerConfig {
            count: config.workers.count,
            queue_capacity: config.workers.queue_capacity,
            default_max_retry: config.workers.default_max_retry,
        },
        shutdown.clone(),
    ));
    let webhook_handler = Arc::new(WebhookJobHandler::new(
        Arc::clone(&client),
        Arc::clone(&tracker),
        config.executor.timeout(),
    ));
    pool.register(Arc::clone(&webhook_handler) as Arc<dyn JobHandler>)
        .await;
    pool.register(Arc::new(BatchJobHandler::new(Arc::clone(&webhook_handler))))
        .await;
    pool.register(Arc::new(ScheduledJobHandler::new(webhook_handler)))
        .await;
    pool.register(Arc::new(HealthCheckJobHandler::new(Arc::clone(&client))))
        .await;
    let workers = pool.start().await;

    let state = AppState {
        config,
        client,
        tracker,
        pool,
        logs,
        stats,
        http_metrics: Arc::new(HttpMetrics::new()),
        rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_PER_MINUTE)),
        shutdown,
    };

    let mut tasks = vec![prober, retention, checkpointer];
    tasks.extend(workers);

    Ok((state, Background { store, tasks }))
}

/// Build the router over an existing state.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/workers", get(handlers::worker_stats))
        .route("/workers/jobs", post(handlers::submit_job))
        // Plugin catalogue, proxied to the executor.
        .route("/api/v1/plugins", get(handlers::list_plugins))
        .route("/api/v1/plugins/{plugin}", get(handlers::plugin_info))
        // Synchronous webhook invocation.
        .route(
            "/api/v1/webhook/{plugin}",
            get(handlers::webhook)
                .post(handlers::webhook)
                .put(handlers::webhook)
                .delete(handlers::webhook),
        )
        // Execution history and admin.
        .route("/api/v1/executions", get(handlers::list_executions))
        .route("/api/v1/executions/stats", get(handlers::execution_stats))
        .route(
            "/api/v1/executions/stats/{plugin}",
            get(handlers::plugin_execution_stats),
        )
        .route(
            "/api/v1/executions/storage/info",
            get(handlers::storage_info),
        )
        .route(
            "/api/v1/executions/cleanup",
            delete(handlers::cleanup_executions),
        )
        .route("/api/v1/executions/{id}", get(handlers::get_execution))
        // Dashboard read-models.
        .route("/api/dashboard/status", get(dashboard::status))
        .route("/api/dashboard/plugins", get(dashboard::plugins))
        .route("/api/dashboard/logs", get(dashboard::logs))
        .route("/api/dashboard/stats", get(dashboard::stats))
        .fallback(handlers::fallback)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(recovery_response)) // 1. recovery (outermost)
                .layer(CompressionLayer::new()) // 2. compression
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    cache_directives_middleware,
                )) // 3. cache directives + timeout hint
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    security_headers_middleware,
                )) // 4. security headers
                .layer(cors) // 5. CORS
                .layer(axum::middleware::from_fn(logging_middleware)) // 6. logger
                .layer(axum::middleware::from_fn(request_id_middleware)) // 7. request id
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                )) // 8. metrics
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_middleware,
                )) // 9. rate limiting (release mode only)
                .layer(TimeoutLayer::new(state.config.read_timeout())) // 10. request deadline (innermost)
                .layer(DefaultBodyLimit::max(handlers::MAX_BODY_BYTES + 1024)),
        )
        .with_state(state)
}

/// Convenience for tests and embedding: build state and router in one go.
pub async fn create_server(config: BridgeConfig) -> anyhow::Result<Router> {
    let (state, _background) = build_state(config, CancellationToken::new()).await?;
    Ok(build_router(state))
}

/// Bind, serve, and run the full shutdown sequence on signal.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let (state, background) = build_state(config, shutdown.clone()).await?;

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, mode = %state.config.server.mode, "webhook bridge listening");

    let app = build_router(state.clone());
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!(
                grace_seconds = SHUTDOWN_GRACE.as_secs(),
                "shutdown signal received, draining"
            );
            signal_token.cancel();
        })
        .await?;

    // The listener is closed; drain the rest of the system.
    shutdown.cancel();
    let drain = async {
        for task in background.tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("background tasks did not drain within the grace window");
    }

    if let Err(e) = state.stats.save().await {
        tracing::error!(error = %e, "final stats flush failed");
    }
    if let Err(e) = state.logs.flush().await {
        tracing::error!(error = %e, "log shadow sync failed");
    }
    state.client.close();
    background.store.close().await;

    tracing::info!("webhook bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
