//! Distributed fixed-window rate limiter
//!
//! Counters live in the shared key-value store under
//! `ratelimit:{scope}:{key}`, so every service instance sees the same budget.
//! One `take` is a single atomic round trip:
//!
//! ```text
//! INCR key ──▶ n == 1 ? PEXPIRE key W ──▶ PTTL key ──▶ (n, ttl)
//! ```
//!
//! The limiter fails open: when the store is unreachable the request is
//! allowed, a warning is logged and `rate_limiter_unavailable` increments.

mod middleware;

pub use middleware::{RateLimitPolicy, client_ip, rate_limit_middleware};

use crate::core::clock::Clock;
use crate::core::error::RealtimeError;
use crate::core::metrics::RealtimeMetrics;
use crate::core::service::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;

/// Scope of authentication endpoints, keyed by client IP
pub const SCOPE_AUTH: &str = "auth";
/// Scope of duplex session opens, keyed by user ID
pub const SCOPE_WS: &str = "ws";

/// Outcome of one [`RateLimiter::take`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window ends
    pub reset_at: i64,
    /// Seconds to wait before retrying, only set when rejected
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    /// The error to surface for a rejected take
    pub fn to_error(&self) -> RealtimeError {
        RealtimeError::RateLimited {
            reset_at: self.reset_at,
            retry_after: self.retry_after.unwrap_or(1),
        }
    }

    /// `Ok` when allowed, `RateLimited` otherwise
    pub fn check(self) -> Result<Self, RealtimeError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

/// Shared-store rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RealtimeMetrics>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    /// Count one request against `(scope, key)`
    pub async fn take(&self, scope: &str, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        let bucket = format!("ratelimit:{}:{}", scope, key);
        let now = self.clock.now().timestamp();

        let (count, ttl) = match self.store.incr_window(&bucket, window).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.rate_limiter_unavailable.inc();
                tracing::warn!(
                    scope,
                    key,
                    error = %e,
                    "rate limiter store unavailable, allowing request"
                );
                return RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at: now + ceil_secs(window) as i64,
                    retry_after: None,
                };
            }
        };

        let ttl_secs = ceil_secs(ttl).max(1);
        let reset_at = now + ttl_secs as i64;

        if count > limit {
            tracing::debug!(scope, key, count, limit, "rate limit exceeded");
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(ttl_secs),
            }
        } else {
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - count,
                reset_at,
                retry_after: None,
            }
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::storage::InMemoryKeyValue;
    use chrono::{TimeZone, Utc};

    fn limiter(kv: &InMemoryKeyValue) -> (RateLimiter, Arc<RealtimeMetrics>) {
        let metrics = Arc::new(RealtimeMetrics::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        (
            RateLimiter::new(Arc::new(kv.clone()), clock, metrics.clone()),
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_up_to_limit_then_rejects() {
        let kv = InMemoryKeyValue::new();
        let (limiter, _) = limiter(&kv);
        let window = Duration::from_secs(60);

        for expected_remaining in (0..3).rev() {
            let d = limiter.take(SCOPE_AUTH, "10.0.0.1", 3, window).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let rejected = limiter.take(SCOPE_AUTH, "10.0.0.1", 3, window).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(60));
        assert!(matches!(
            rejected.check(),
            Err(RealtimeError::RateLimited { retry_after: 60, .. })
        ));

        // Other keys have their own budget
        assert!(limiter.take(SCOPE_AUTH, "10.0.0.2", 3, window).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_ttl() {
        let kv = InMemoryKeyValue::new();
        let (limiter, _) = limiter(&kv);
        let window = Duration::from_secs(10);

        assert!(limiter.take(SCOPE_WS, "u1", 1, window).await.allowed);
        assert!(!limiter.take(SCOPE_WS, "u1", 1, window).await.allowed);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.take(SCOPE_WS, "u1", 1, window).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_do_not_extend_window() {
        let kv = InMemoryKeyValue::new();
        let (limiter, _) = limiter(&kv);
        let window = Duration::from_secs(60);

        limiter.take(SCOPE_WS, "u1", 1, window).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        let d = limiter.take(SCOPE_WS, "u1", 1, window).await;
        assert_eq!(d.retry_after, Some(30));
        assert_eq!(kv.ttl("ratelimit:ws:u1"), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let kv = InMemoryKeyValue::new();
        let (limiter, metrics) = limiter(&kv);
        kv.set_available(false);

        for _ in 0..20 {
            let d = limiter.take(SCOPE_AUTH, "10.0.0.1", 1, Duration::from_secs(60)).await;
            assert!(d.allowed);
        }
        assert_eq!(metrics.rate_limiter_unavailable.get(), 20);
    }
}
