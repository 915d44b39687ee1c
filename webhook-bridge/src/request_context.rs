//! # Request Context
//!
//! Per-request identity and timing. Request IDs come from the OS RNG: 16
//! random bytes, hex-encoded, prefixed `req_`. A timestamp+counter form is
//! kept only as a fallback for the (unlikely) case that the RNG fails.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::bridge_error::{ApiError, BridgeError};

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a request id: `req_` + 32 hex chars from a secure RNG.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => {
            let mut hex = String::with_capacity(36);
            hex.push_str("req_");
            for byte in bytes {
                use std::fmt::Write;
                let _ = write!(hex, "{byte:02x}");
            }
            hex
        }
        Err(e) => {
            // Degraded uniqueness beats no id at all.
            tracing::error!(error = %e, "os rng failed, falling back to timestamp ids");
            let counter = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("req_{}_{counter}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
        }
    }
}

/// Context attached to every request by the request-id middleware.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Extractor giving handlers their path, method, and request id, mainly
/// so error responses can carry the full envelope.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub path: String,
    pub method: String,
    pub request_id: Option<String>,
}

impl RequestMeta {
    /// Bind an error to this request's envelope fields.
    pub fn fail(&self, error: BridgeError) -> ApiError {
        ApiError {
            error,
            path: self.path.clone(),
            method: self.method.clone(),
            request_id: self.request_id.clone(),
            details: None,
        }
    }
}

impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestMeta {
            path: parts.uri.path().to_string(),
            method: parts.method.to_string(),
            request_id: parts
                .extensions
                .get::<RequestContext>()
                .map(|ctx| ctx.request_id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_have_expected_shape() {
        let id = new_request_id();
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 4 + 32);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
    }
}
