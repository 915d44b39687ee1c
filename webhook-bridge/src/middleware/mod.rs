//! # HTTP Middleware
//!
//! The bridge's middleware stack, applied in [`crate::server`] in this
//! order (outermost first):
//!
//! 1. **Recovery**: panics become 500 `internal` envelopes
//! 2. **Compression**: gzip response bodies
//! 3. **Cache directives**: API responses are never cached
//! 4. **Security headers**: nosniff, frame deny, referrer policy,
//!    minimal CSP, HSTS in release mode
//! 5. **CORS**: origins/methods/headers from configuration
//! 6. **Logger**: one structured line per request
//! 7. **Request ID**: inbound `X-Request-ID` accepted, otherwise 16
//!    random bytes hex-encoded
//! 8. **Metrics**: atomic counters plus the `X-Execution-Time` header
//! 9. **Rate limiting**: release mode only, fixed window per client

use crate::config::CorsConfig;
use crate::request_context::{new_request_id, RequestContext};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Maximum accepted length for an inbound `X-Request-ID`.
const MAX_INBOUND_REQUEST_ID: usize = 128;

/// Accept or mint the request id and stamp it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let inbound = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_INBOUND_REQUEST_ID)
        .map(str::to_string);

    let request_id = inbound.unwrap_or_else(new_request_id);
    req.extensions_mut()
        .insert(RequestContext::new(request_id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

/// Record counters and stamp `X-Execution-Time` on every response.
pub async fn metrics_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed();

    state
        .http_metrics
        .record(response.status().as_u16(), elapsed.as_micros() as u64);

    let mut response = response;
    let rendered = format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0);
    if let Ok(value) = HeaderValue::from_str(&rendered) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-execution-time"), value);
    }
    response
}

/// One structured log line per request.
pub async fn logging_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(req).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request processed"
    );
    response
}

/// Security headers; HSTS only in release mode.
pub async fn security_headers_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'self'"),
    );
    if state.config.server.is_release() {
        headers.insert(
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

/// API responses are dynamic: forbid caching, and advertise the call
/// deadline so clients can size their own.
pub async fn cache_directives_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let is_api = req.uri().path().starts_with("/api/")
        || matches!(req.uri().path(), "/health" | "/metrics" | "/workers");
    let mut response = next.run(req).await;
    if is_api {
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store"),
        );
        let timeout = format!("{}s", state.config.executor.timeout_s);
        if let Ok(value) = HeaderValue::from_str(&timeout) {
            headers.insert(HeaderName::from_static("x-timeout"), value);
        }
    }
    response
}

/// CORS layer from configuration, the same construction the rest of the
/// stack uses: wildcard short-circuits to `Any`, otherwise each origin is
/// parsed individually.
pub fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    if !cors.enabled {
        return CorsLayer::new();
    }

    let mut layer = CorsLayer::new();

    if cors.allowed_origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
        // Credentials are only valid with explicit origins.
        if cors.allow_credentials {
            layer = layer.allow_credentials(true);
        }
    }

    let methods: Vec<axum::http::Method> = cors
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = if methods.is_empty() {
        layer.allow_methods(Any)
    } else {
        layer.allow_methods(methods)
    };

    let headers: Vec<HeaderName> = cors
        .allowed_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    layer = if headers.is_empty() {
        layer.allow_headers(Any)
    } else {
        layer.allow_headers(headers)
    };

    let expose: Vec<HeaderName> = cors
        .expose_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    if !expose.is_empty() {
        layer = layer.expose_headers(expose);
    }

    if let Some(max_age) = cors.max_age_s {
        layer = layer.max_age(std::time::Duration::from_secs(max_age));
    }

    layer
}

/// Fixed-window request limiter keyed by client address. Applied only in
/// release mode.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, (u64, u32)>,
    limit_per_minute: u32,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            windows: DashMap::new(),
            limit_per_minute,
        }
    }

    /// True when the client is within its budget for the current window.
    pub fn allow(&self, client: &str) -> bool {
        let now_minute = chrono::Utc::now().timestamp() as u64 / 60;
        let mut entry = self.windows.entry(client.to_string()).or_insert((now_minute, 0));
        let (window, count) = *entry;
        if window != now_minute {
            *entry = (now_minute, 1);
            return true;
        }
        if count >= self.limit_per_minute {
            return false;
        }
        *entry = (window, count + 1);
        true
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.server.is_release() {
        return next.run(req).await;
    }

    let client = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();

    if !state.rate_limiter.allow(&client) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": "rate_limited",
                "message": "too many requests",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        )
            .into_response();
    }
    next.run(req).await
}

/// Panic recovery body: the standard envelope with kind `internal`.
pub fn recovery_response(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({
            "error": "internal",
            "message": "internal server error",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_window_budget() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        // Other clients are unaffected.
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn cors_layer_handles_wildcard_and_explicit_origins() {
        // Smoke-construct both shapes; panics would fail the test.
        let wildcard = CorsConfig::default();
        let _ = cors_layer(&wildcard);

        let explicit = CorsConfig {
            allowed_origins: vec!["https://ops.example.com".to_string()],
            allow_credentials: true,
            ..Default::default()
        };
        let _ = cors_layer(&explicit);

        let disabled = CorsConfig {
            enabled: false,
            ..Default::default()
        };
        let _ = cors_layer(&disabled);
    }
}
