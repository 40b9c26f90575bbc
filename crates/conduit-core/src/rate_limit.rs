//! Per-backend rate limiting over the shared cache.
//!
//! Each (backend, operation class) pair owns one counter. The counter is
//! checked and incremented in a single atomic cache update, and every
//! increment re-arms the window.

use std::sync::Arc;
use std::time::Duration;

use conduit_abstraction::BackendId;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheUpdate, Result, SharedCache};

/// Operation class for connect attempts.
pub const CONNECT: &str = "connect";
/// Operation class for requests.
pub const REQUEST: &str = "request";

/// Maximum calls per rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Calls allowed before the window expires.
    pub max_requests: u64,
    /// Window length; also the counter's TTL.
    pub window: Duration,
}

impl RateLimit {
    /// Creates a limit.
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call may proceed; the counter was incremented.
    Allowed,
    /// The limit is exhausted; nothing was written.
    Denied,
}

impl RateDecision {
    /// Whether the call may proceed.
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

/// Checks and counts calls per backend and operation class.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

fn cache_key(backend: BackendId, operation: &str) -> String {
    format!("rate_limit:{backend}:{operation}")
}

impl RateLimiter {
    /// Creates a limiter storing its counters in `cache`.
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    /// Checks `operation` for `backend` against `limit`, counting the call if allowed.
    ///
    /// A `None` limit means the operation class is not limited.
    pub async fn check_limit(
        &self,
        backend: BackendId,
        operation: &str,
        limit: Option<RateLimit>,
    ) -> Result<RateDecision> {
        let Some(limit) = limit else {
            return Ok(RateDecision::Allowed);
        };

        let max = limit.max_requests;
        let previous = self
            .cache
            .update(&cache_key(backend, operation), limit.window, &|current| {
                let count = current.and_then(Value::as_u64).unwrap_or(0);
                if count >= max { CacheUpdate::Keep } else { CacheUpdate::Set(Value::from(count + 1)) }
            })
            .await?;

        let count = previous.and_then(|v| v.as_u64()).unwrap_or(0);
        if count >= max {
            warn!(backend_id = %backend, operation, count, max, "Rate limit exceeded");
            Ok(RateDecision::Denied)
        } else {
            debug!(backend_id = %backend, operation, count = count + 1, max, "Rate limit check passed");
            Ok(RateDecision::Allowed)
        }
    }

    /// Clears the counter for `backend` and `operation`.
    pub async fn reset(&self, backend: BackendId, operation: &str) -> Result<()> {
        self.cache.delete(&cache_key(backend, operation)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryCache::new()))
    }

    async fn counted(limiter: &RateLimiter, backend: BackendId, operation: &str) -> u64 {
        let value = limiter.cache.get(&cache_key(backend, operation)).await.unwrap();
        value.and_then(|v| v.as_u64()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_n_allowed_then_denied() {
        let limiter = limiter();
        let backend = BackendId::new_random();
        let limit = Some(RateLimit::new(3, Duration::from_secs(60)));

        for _ in 0..3 {
            assert_eq!(limiter.check_limit(backend, REQUEST, limit).await.unwrap(), RateDecision::Allowed);
        }
        assert_eq!(limiter.check_limit(backend, REQUEST, limit).await.unwrap(), RateDecision::Denied);
        // Denials do not count.
        assert_eq!(counted(&limiter, backend, REQUEST).await, 3);
    }

    #[tokio::test]
    async fn test_allowed_after_window() {
        let limiter = limiter();
        let backend = BackendId::new_random();
        let limit = Some(RateLimit::new(2, Duration::from_millis(50)));

        assert!(limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());
        assert!(limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());
        assert!(!limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_classes_and_backends_are_independent() {
        let limiter = limiter();
        let a = BackendId::new_random();
        let b = BackendId::new_random();
        let limit = Some(RateLimit::new(1, Duration::from_secs(60)));

        assert!(limiter.check_limit(a, CONNECT, limit).await.unwrap().is_allowed());
        assert!(limiter.check_limit(a, REQUEST, limit).await.unwrap().is_allowed());
        assert!(limiter.check_limit(b, CONNECT, limit).await.unwrap().is_allowed());
        assert!(!limiter.check_limit(a, CONNECT, limit).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unlimited_class_always_allowed() {
        let limiter = limiter();
        let backend = BackendId::new_random();

        for _ in 0..10 {
            assert!(limiter.check_limit(backend, "stream", None).await.unwrap().is_allowed());
        }
        assert_eq!(counted(&limiter, backend, "stream").await, 0);
        let closed = Some(RateLimit::new(0, Duration::from_secs(60)));
        assert!(!limiter.check_limit(backend, CONNECT, closed).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_reset() {
        let limiter = limiter();
        let backend = BackendId::new_random();
        let limit = Some(RateLimit::new(1, Duration::from_secs(60)));
        assert!(limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());
        limiter.reset(backend, CONNECT).await.unwrap();
        assert!(limiter.check_limit(backend, CONNECT, limit).await.unwrap().is_allowed());
    }
}
