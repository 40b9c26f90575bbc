//! Shared cache used for rate-limit windows, error windows and metrics.
//!
//! Every entry carries its own time-to-live. A write re-arms the TTL, so a
//! counter stays alive for one full window after its last update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors raised by a cache backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache could not be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A stored value has an unexpected shape.
    #[error("Corrupt cache entry '{key}': {reason}")]
    Corrupt {
        /// The key that was read.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// What an [`SharedCache::update`] closure wants done with the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// Leave the entry (and its TTL) untouched.
    Keep,
    /// Store a new value and re-arm the TTL.
    Set(Value),
    /// Remove the entry.
    Delete,
}

/// A key/value store with per-entry expiry.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Returns the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Removes `key`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically reads `key`, applies `f` and writes the outcome with `ttl`.
    ///
    /// Returns the value `f` observed. No other update to the same key can
    /// interleave between the read and the write.
    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: &(dyn for<'v> Fn(Option<&'v Value>) -> CacheUpdate + Send + Sync),
    ) -> Result<Option<Value>>;

    /// Adds one to an integer counter and returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let previous = self
            .update(key, ttl, &|current| {
                let count = current.and_then(Value::as_u64).unwrap_or(0);
                CacheUpdate::Set(Value::from(count + 1))
            })
            .await?;
        Ok(previous.and_then(|v| v.as_u64()).unwrap_or(0) + 1)
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Writes between two sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Process-local [`SharedCache`].
///
/// Expired entries are never returned. They are swept out every
/// `purge_interval` writes.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::with_purge_interval(DEFAULT_PURGE_INTERVAL)
    }
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache that sweeps expired entries every `writes` writes.
    pub fn with_purge_interval(writes: u64) -> Self {
        Self { entries: Mutex::new(HashMap::new()), writes: AtomicU64::new(0), purge_interval: writes.max(1) }
    }

    /// Drops expired entries now and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        sweep(&mut *self.entries.lock().await, Instant::now())
    }

    fn after_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval == 0 {
            let purged = sweep(entries, now);
            if purged > 0 {
                debug!(purged, remaining = entries.len(), "Swept expired cache entries");
            }
        }
    }

    /// Number of stored entries, live or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
        self.after_write(&mut entries, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: &(dyn for<'v> Fn(Option<&'v Value>) -> CacheUpdate + Send + Sync),
    ) -> Result<Option<Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let current = entries.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone());

        match f(current.as_ref()) {
            CacheUpdate::Keep => {}
            CacheUpdate::Set(value) => {
                entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
                self.after_write(&mut entries, now);
            }
            CacheUpdate::Delete => {
                entries.remove(key);
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", json!({"a": 1}), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"a": 1})));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryCache::new();
        cache.set("k", json!(1), Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_entries() {
        let cache = InMemoryCache::with_purge_interval(4);
        cache.set("old:a", json!(1), Duration::from_millis(10)).await.unwrap();
        cache.set("old:b", json!(1), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.len().await, 2);

        cache.set("live", json!(1), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len().await, 3);
        cache.increment("counter", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("live").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_update_keep_does_not_rearm() {
        let cache = InMemoryCache::new();
        cache.set("k", json!(5), Duration::from_millis(30)).await.unwrap();
        let seen = cache.update("k", Duration::from_secs(60), &|_| CacheUpdate::Keep).await.unwrap();
        assert_eq!(seen, Some(json!(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_counts_from_zero() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.increment("c", ttl).await.unwrap(), 1);
        assert_eq!(cache.increment("c", ttl).await.unwrap(), 2);
        assert_eq!(cache.get("c").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let cache = Arc::new(InMemoryCache::new());
        let ttl = Duration::from_secs(60);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.increment("c", ttl).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(cache.get("c").await.unwrap(), Some(json!(50)));
    }
}
