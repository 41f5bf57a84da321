//! Axum middleware applying the `auth:{ip}` budget to HTTP endpoints

use super::{RateLimitDecision, RateLimiter, SCOPE_AUTH};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Limiter plus the budget applied by [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub limiter: Arc<RateLimiter>,
    pub scope: String,
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    /// The `auth:{ip}` policy
    pub fn auth(limiter: Arc<RateLimiter>, limit: u64, window: Duration) -> Self {
        Self {
            limiter,
            scope: SCOPE_AUTH.to_string(),
            limit,
            window,
        }
    }
}

/// Resolve the caller's address
///
/// First entry of `X-Forwarded-For`, then `X-Real-IP`, then the socket
/// peer. Header values that do not parse as an IP are ignored.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|ip| ip.trim().parse().ok())
        })
        .or_else(|| peer.map(|addr| addr.ip()))
}

/// Rate-limit every request by client IP
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/auth/login", post(login))
///     .layer(axum::middleware::from_fn_with_state(policy, rate_limit_middleware));
/// ```
pub async fn rate_limit_middleware(
    State(policy): State<RateLimitPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_ip(request.headers(), peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let decision = policy
        .limiter
        .take(&policy.scope, &key, policy.limit, policy.window)
        .await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        tracing::warn!(scope = %policy.scope, client = %key, "request rate limited");
        decision.to_error().into_response()
    };
    apply_headers(&decision, response.headers_mut());
    response
}

fn apply_headers(decision: &RateLimitDecision, headers: &mut HeaderMap) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(decision.reset_at));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn test_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("198.51.100.2".parse().unwrap())
        );

        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer)),
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_garbage_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, None), None);
    }
}
