//! # Executor SDK
//!
//! Client library for the webhook-bridge plugin executor: a separate
//! process that loads user plugins and answers a four-operation RPC
//! contract (health check, plugin listing, plugin info, plugin execution).
//!
//! The SDK owns everything about talking to that process:
//!
//! - [`client::ExecutorClient`]: the long-lived connection, per-call
//!   deadlines, fast failure while the executor is down, and the
//!   background reconnect loop with capped exponential back-off.
//! - [`messages`]: the stable wire types of the RPC contract.
//! - [`error::ExecutorError`]: failure classification with bridge-wide
//!   error kind strings (`transport`, `timeout`, `not_found`,
//!   `plugin_runtime`, `internal`).
//!
//! The bridge server injects one shared client instance into its HTTP
//! handlers and worker pool; all methods take `&self` and are safe for
//! concurrent use.

pub mod client;
pub mod error;
pub mod messages;

pub use client::{
    ConnectionState, ConnectionStatus, ExecutorClient, ExecutorConfig, ReconnectPolicy,
};
pub use error::ExecutorError;
pub use messages::{
    ExecutePluginRequest, ExecutePluginResponse, GetPluginInfoRequest, GetPluginInfoResponse,
    HealthCheckRequest, HealthCheckResponse, ListPluginsRequest, ListPluginsResponse, PluginInfo,
};
