//! # Webhook Bridge
//!
//! A bridge between HTTP webhooks and an out-of-process plugin runtime.
//! Incoming webhook calls are validated, dispatched to named plugins over
//! the executor RPC contract, tracked durably in an embedded SQLite
//! store, and exposed back out through operational telemetry endpoints.
//!
//! ## Architecture
//!
//! - **`config`**: typed configuration with TOML + environment loading
//! - **`server`**: component wiring, router, middleware, shutdown
//! - **`handlers`**: the HTTP API surface
//! - **`dashboard`**: read-model endpoints for the embedded dashboard
//! - **`middleware`**: request-id, metrics, security, CORS, rate limiting
//! - **`storage`**: execution records, migrations, the SQLite store
//! - **`tracker`**: execution lifecycle and real-time counters
//! - **`worker`**: the bounded job queue and its handlers
//! - **`logs`**: the in-memory log ring with its file shadow
//! - **`stats`**: persisted per-plugin statistics
//!
//! Dependencies flow one way: HTTP → {tracker, pool, client, logs,
//! stats} → store. Components are wired by explicit injection in
//! [`server::build_state`]; the only package-level constant is
//! [`VERSION`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use webhook_bridge::{config::BridgeConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load(Some("config.toml"))?;
//!     server::run(config).await
//! }
//! ```

pub mod bridge_error;
pub mod config;
pub mod dashboard;
pub mod handlers;
pub mod logs;
pub mod metrics;
pub mod middleware;
pub mod request_context;
pub mod server;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod worker;

/// Service version reported by `/health` and the dashboard.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use server::{build_router, build_state, create_server, AppState};
