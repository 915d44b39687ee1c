//! # Executor RPC Client
//!
//! Long-lived client for the out-of-process plugin executor. The executor
//! exposes four unary operations over JSON/HTTP; this module owns the
//! single transport to it and the policies around it:
//!
//! - **Lazy connection**: nothing is dialed until the first call.
//! - **Per-call deadlines**: every operation runs under a
//!   `tokio::time::timeout`; expiry surfaces as [`ExecutorError::Timeout`].
//! - **Fast failure while down**: once the transport breaks, callers get
//!   [`ExecutorError::Unavailable`] immediately. Request threads never wait
//!   on reconnection.
//! - **Background reconnect**: a single reconnect task probes the executor
//!   with exponential back-off (capped) until it answers again.
//! - **Health probing**: an optional periodic prober refreshes the
//!   connection state surfaced by the bridge's `/health` endpoint.
//!
//! The client is cheap to share: all state lives behind `Arc`s and every
//! method takes `&self`.

use crate::error::ExecutorError;
use crate::messages::{
    ExecutePluginRequest, ExecutePluginResponse, GetPluginInfoRequest, GetPluginInfoResponse,
    HealthCheckRequest, HealthCheckResponse, ListPluginsRequest, ListPluginsResponse, PluginInfo,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection state as observed by the most recent call or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The executor answered its last probe or call.
    Healthy,
    /// The executor answered but reported itself unhealthy.
    Degraded,
    /// The transport is broken; calls fail fast until reconnect succeeds.
    Down,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Healthy => "healthy",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Down => "down",
        }
    }
}

/// Snapshot of the client's view of the executor connection.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Message from the last failure or unhealthy probe, if any.
    pub last_error: Option<String>,
    /// When the state last changed, RFC 3339.
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Back-off policy for the background reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect probe.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed probe.
    pub multiplier: f64,
    /// Upper bound on the probe delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`ExecutorClient`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base URL of the executor RPC endpoint, e.g. `http://127.0.0.1:50051`.
    pub base_url: String,
    /// Default per-call deadline.
    pub timeout: Duration,
    /// Back-off policy for reconnect probes.
    pub reconnect: ReconnectPolicy,
}

impl ExecutorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

struct ConnectionHealth {
    state: ConnectionState,
    last_error: Option<String>,
    since: chrono::DateTime<chrono::Utc>,
}

/// Client for the plugin executor RPC contract.
pub struct ExecutorClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    reconnect: ReconnectPolicy,
    health: Arc<RwLock<ConnectionHealth>>,
    /// Guards against spawning more than one reconnect loop.
    reconnecting: Arc<AtomicBool>,
    /// Cancels background tasks spawned by this client.
    shutdown: CancellationToken,
}

impl ExecutorClient {
    /// Create a client. No connection is attempted until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Internal`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ExecutorError::Internal {
                message: format!("failed to build http client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            reconnect: config.reconnect,
            health: Arc::new(RwLock::new(ConnectionHealth {
                state: ConnectionState::Healthy,
                last_error: None,
                since: chrono::Utc::now(),
            })),
            reconnecting: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Current view of the executor connection.
    pub async fn status(&self) -> ConnectionStatus {
        let health = self.health.read().await;
        ConnectionStatus {
            state: health.state,
            last_error: health.last_error.clone(),
            since: health.since,
        }
    }

    /// True when calls are currently being accepted.
    pub async fn is_available(&self) -> bool {
        self.health.read().await.state != ConnectionState::Down
    }

    /// Probe the executor's health.
    pub async fn health_check(&self, service: &str) -> Result<HealthCheckResponse, ExecutorError> {
        let resp: HealthCheckResponse = self
            .call(
                "/rpc/health",
                &HealthCheckRequest {
                    service: service.to_string(),
                },
                self.timeout,
            )
            .await?;

        if resp.healthy {
            self.mark_healthy().await;
        } else {
            self.mark_degraded(&resp.message).await;
        }
        Ok(resp)
    }

    /// List plugins loaded in the executor.
    pub async fn list_plugins(
        &self,
        filter: Option<String>,
    ) -> Result<ListPluginsResponse, ExecutorError> {
        self.call("/rpc/plugins/list", &ListPluginsRequest { filter }, self.timeout)
            .await
    }

    /// Fetch metadata for one plugin.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::PluginNotFound`] when the executor does not know
    /// the name.
    pub async fn get_plugin_info(&self, name: &str) -> Result<PluginInfo, ExecutorError> {
        let resp: GetPluginInfoResponse = self
            .call(
                "/rpc/plugins/info",
                &GetPluginInfoRequest {
                    name: name.to_string(),
                },
                self.timeout,
            )
            .await?;

        match resp.plugin {
            Some(plugin) if resp.found => Ok(plugin),
            _ => Err(ExecutorError::PluginNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Invoke a plugin under the given deadline.
    ///
    /// The raw response is returned even when the plugin raised; callers
    /// inspect [`ExecutePluginResponse::is_error`] and decide how to map
    /// the runtime's status code.
    pub async fn execute_plugin(
        &self,
        request: ExecutePluginRequest,
        deadline: Duration,
    ) -> Result<ExecutePluginResponse, ExecutorError> {
        self.call("/rpc/execute", &request, deadline).await
    }

    /// Spawn the periodic health prober.
    ///
    /// The prober refreshes the connection state every `interval` until the
    /// token is cancelled. Probe failures only flip the state flag; they
    /// are never escalated.
    pub fn spawn_health_prober(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("executor health prober stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match client.health_check("").await {
                            Ok(resp) if resp.healthy => {
                                tracing::trace!("executor health probe ok");
                            }
                            Ok(resp) => {
                                tracing::warn!(message = %resp.message, "executor reports degraded");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "executor health probe failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks owned by this client.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn call<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp, ExecutorError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        // Fail fast while the reconnect loop owns the transport. The only
        // exception is the health path, which the loop itself relies on.
        if path != "/rpc/health" && self.health.read().await.state == ConnectionState::Down {
            return Err(ExecutorError::Unavailable);
        }

        let url = format!("{}{}", self.base_url, path);
        let fut = self.http.post(&url).json(request).send();

        let response = match tokio::time::timeout(deadline, fut).await {
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                let err = ExecutorError::from(e);
                if matches!(err, ExecutorError::Transport { .. }) {
                    self.mark_down(&err.to_string()).await;
                }
                return Err(err);
            }
            Ok(Ok(resp)) => resp,
        };

        let status = response.status();
        if !status.is_success() {
            let err = ExecutorError::Transport {
                message: format!("executor returned http {status} for {path}"),
            };
            self.mark_down(&err.to_string()).await;
            return Err(err);
        }

        let bytes = match tokio::time::timeout(deadline, response.bytes()).await {
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            Ok(result) => result.map_err(ExecutorError::from)?,
        };

        let decoded = serde_json::from_slice(&bytes)?;
        // Any successful round-trip proves the transport; a Down state set
        // by a concurrent caller must not outlive it.
        if self.health.read().await.state == ConnectionState::Down {
            self.mark_healthy().await;
        }
        Ok(decoded)
    }

    async fn mark_healthy(&self) {
        let mut health = self.health.write().await;
        if health.state != ConnectionState::Healthy {
            tracing::info!("executor connection restored");
            health.state = ConnectionState::Healthy;
            health.last_error = None;
            health.since = chrono::Utc::now();
        }
    }

    async fn mark_degraded(&self, message: &str) {
        let mut health = self.health.write().await;
        if health.state != ConnectionState::Degraded {
            tracing::warn!(message, "executor degraded");
            health.state = ConnectionState::Degraded;
            health.since = chrono::Utc::now();
        }
        health.last_error = Some(message.to_string());
    }

    async fn mark_down(&self, message: &str) {
        {
            let mut health = self.health.write().await;
            if health.state != ConnectionState::Down {
                tracing::error!(message, "executor connection lost");
                health.state = ConnectionState::Down;
                health.since = chrono::Utc::now();
            }
            health.last_error = Some(message.to_string());
        }
        self.spawn_reconnect_loop();
    }

    /// Start the reconnect loop unless one is already running.
    fn spawn_reconnect_loop(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let policy = self.reconnect.clone();
        let health = Arc::clone(&self.health);
        let reconnecting = Arc::clone(&self.reconnecting);
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            let mut delay = policy.initial_delay;
            let url = format!("{base_url}/rpc/health");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let probe = http
                    .post(&url)
                    .json(&HealthCheckRequest::default())
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await;

                match probe {
                    Ok(resp) if resp.status().is_success() => {
                        let mut h = health.write().await;
                        h.state = ConnectionState::Healthy;
                        h.last_error = None;
                        h.since = chrono::Utc::now();
                        tracing::info!("executor reconnect succeeded");
                        break;
                    }
                    Ok(resp) => {
                        tracing::debug!(status = %resp.status(), "executor reconnect probe rejected");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "executor reconnect probe failed");
                    }
                }

                delay = std::cmp::min(delay.mul_f64(policy.multiplier), policy.max_delay);
            }
            reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

impl Drop for ExecutorClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ExecutorClient {
        ExecutorClient::new(
            ExecutorConfig::new(server.uri()).with_timeout(Duration::from_secs(2)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn health_check_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "healthy": true,
                "message": "ok"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let resp = client.health_check("").await.unwrap();
        assert!(resp.healthy);
        assert_eq!(client.status().await.state, ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_probe_marks_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "healthy": false,
                "message": "interpreter restarting"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let resp = client.health_check("").await.unwrap();
        assert!(!resp.healthy);

        let status = client.status().await;
        assert_eq!(status.state, ConnectionState::Degraded);
        assert_eq!(status.last_error.as_deref(), Some("interpreter restarting"));
    }

    #[tokio::test]
    async fn execute_plugin_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/execute"))
            .and(body_partial_json(serde_json::json!({
                "name": "hello",
                "http_method": "POST"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status_code": 200,
                "message": "ok",
                "data": {"greeting": "hello world"},
                "error": "",
                "execution_time_seconds": 0.045
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut data = HashMap::new();
        data.insert("name".to_string(), "world".to_string());

        let resp = client
            .execute_plugin(
                ExecutePluginRequest {
                    name: "hello".to_string(),
                    http_method: "POST".to_string(),
                    data,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.execution_time_ms(), 45);
        assert_eq!(resp.data.get("greeting").unwrap(), "hello world");
    }

    #[tokio::test]
    async fn get_plugin_info_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/plugins/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "plugin": null,
                "found": false
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get_plugin_info("missing").await.unwrap_err();
        assert!(matches!(err, ExecutorError::PluginNotFound { .. }));
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn transport_failure_marks_down_and_fails_fast() {
        // Point at a server that is immediately dropped to force refusal.
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let client = ExecutorClient::new(
            ExecutorConfig::new(uri).with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

        let err = client
            .execute_plugin(
                ExecutePluginRequest {
                    name: "hello".to_string(),
                    http_method: "GET".to_string(),
                    data: HashMap::new(),
                },
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(client.status().await.state, ConnectionState::Down);

        // Second call must fail without a network round-trip.
        let err = client
            .execute_plugin(
                ExecutePluginRequest {
                    name: "hello".to_string(),
                    http_method: "GET".to_string(),
                    data: HashMap::new(),
                },
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable));
    }

    #[tokio::test]
    async fn call_timeout_surfaces_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/execute"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status_code": 200}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .execute_plugin(
                ExecutePluginRequest {
                    name: "slow".to_string(),
                    http_method: "GET".to_string(),
                    data: HashMap::new(),
                },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
