//! Per-backend usage metrics kept in the shared cache.
//!
//! All counters live for one rolling window after their last write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_abstraction::{BackendId, ProviderResponse};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheUpdate, Result, SharedCache};

/// Response time summary in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResponseTimes {
    /// Mean of the retained samples.
    pub avg: f64,
    /// Fastest retained sample.
    pub min: f64,
    /// Slowest retained sample.
    pub max: f64,
    /// Number of retained samples.
    pub samples: usize,
}

impl ResponseTimes {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().sum();
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        #[allow(clippy::cast_precision_loss)]
        let avg = sum / samples.len() as f64;
        Some(Self { avg, min, max, samples: samples.len() })
    }
}

/// Read-only view of a backend's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// The backend.
    pub backend_id: BackendId,
    /// Successful connects in the window.
    pub connection_success: u64,
    /// Failed connects in the window.
    pub connection_failure: u64,
    /// Requests in the window.
    pub request_count: u64,
    /// Failed responses in the window.
    pub error_count: u64,
    /// Requests per method.
    pub methods: BTreeMap<String, u64>,
    /// Response times, absent until a request completes.
    pub response_times: Option<ResponseTimes>,
}

/// Records connection and request metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    cache: Arc<dyn SharedCache>,
    window: Duration,
    max_samples: usize,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("window", &self.window)
            .field("max_samples", &self.max_samples)
            .finish_non_exhaustive()
    }
}

fn key(backend: BackendId, name: &str) -> String {
    format!("metrics:{backend}:{name}")
}

fn method_key(backend: BackendId, method: &str) -> String {
    format!("metrics:{backend}:method:{method}:count")
}

impl MetricsCollector {
    /// Creates a collector with the given window and sample cap.
    pub fn new(cache: Arc<dyn SharedCache>, window: Duration, max_samples: usize) -> Self {
        Self { cache, window, max_samples: max_samples.max(1) }
    }

    /// Counts one connect attempt.
    pub async fn record_connection(&self, backend: BackendId, success: bool) -> Result<()> {
        let name = if success { "connections:success" } else { "connections:failure" };
        let count = self.cache.increment(&key(backend, name), self.window).await?;
        debug!(backend_id = %backend, success, count, "Recorded connection metric");
        Ok(())
    }

    /// Counts one completed request and its duration.
    pub async fn record_request(
        &self,
        backend: BackendId,
        method: &str,
        duration: Duration,
        response: &ProviderResponse,
    ) -> Result<()> {
        self.cache.increment(&key(backend, "requests:count"), self.window).await?;
        self.cache.increment(&method_key(backend, method), self.window).await?;
        self.index_method(backend, method).await?;
        self.push_sample(backend, duration.as_secs_f64()).await?;
        if !response.success {
            self.cache.increment(&key(backend, "errors:count"), self.window).await?;
        }
        debug!(
            backend_id = %backend,
            method,
            duration_ms = duration.as_millis() as u64,
            success = response.success,
            "Recorded request metric"
        );
        Ok(())
    }

    async fn index_method(&self, backend: BackendId, method: &str) -> Result<()> {
        let method = method.to_string();
        self.cache
            .update(&key(backend, "methods"), self.window, &|current| {
                let mut methods = string_list(current);
                if !methods.contains(&method) {
                    methods.push(method.clone());
                }
                CacheUpdate::Set(Value::from(methods))
            })
            .await?;
        Ok(())
    }

    async fn push_sample(&self, backend: BackendId, seconds: f64) -> Result<()> {
        let cap = self.max_samples;
        self.cache
            .update(&key(backend, "response_times"), self.window, &|current| {
                let mut samples = float_list(current);
                samples.push(seconds);
                if samples.len() > cap {
                    samples.drain(..samples.len() - cap);
                }
                CacheUpdate::Set(Value::from(samples))
            })
            .await?;
        Ok(())
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        Ok(self.cache.get(key).await?.as_ref().and_then(Value::as_u64).unwrap_or(0))
    }

    /// Reads the backend's metrics without modifying them.
    pub async fn get_metrics(&self, backend: BackendId) -> Result<MetricsSnapshot> {
        let mut methods = BTreeMap::new();
        let index = self.cache.get(&key(backend, "methods")).await?;
        for method in string_list(index.as_ref()) {
            let count = self.counter(&method_key(backend, &method)).await?;
            methods.insert(method, count);
        }

        let samples = self.cache.get(&key(backend, "response_times")).await?;

        Ok(MetricsSnapshot {
            backend_id: backend,
            connection_success: self.counter(&key(backend, "connections:success")).await?,
            connection_failure: self.counter(&key(backend, "connections:failure")).await?,
            request_count: self.counter(&key(backend, "requests:count")).await?,
            error_count: self.counter(&key(backend, "errors:count")).await?,
            methods,
            response_times: ResponseTimes::from_samples(&float_list(samples.as_ref())),
        })
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn float_list(value: Option<&Value>) -> Vec<f64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Arc::new(InMemoryCache::new()), Duration::from_secs(3600), 100)
    }

    #[tokio::test]
    async fn test_one_connect_one_request() {
        let metrics = collector();
        let backend = BackendId::new_random();

        metrics.record_connection(backend, true).await.unwrap();
        metrics
            .record_request(backend, "search", Duration::from_millis(500), &ProviderResponse::success(Value::Null))
            .await
            .unwrap();

        let snapshot = metrics.get_metrics(backend).await.unwrap();
        assert_eq!(snapshot.connection_success, 1);
        assert_eq!(snapshot.connection_failure, 0);
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.error_count, 0);
        assert_eq!(snapshot.methods.get("search"), Some(&1));
        let times = snapshot.response_times.unwrap();
        assert!((times.avg - 0.5).abs() < f64::EPSILON);
        assert!((times.min - 0.5).abs() < f64::EPSILON);
        assert!((times.max - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_errors_and_methods() {
        let metrics = collector();
        let backend = BackendId::new_random();
        let failed = ProviderResponse::failure("boom");
        let ok = ProviderResponse::success(Value::Null);

        metrics.record_connection(backend, false).await.unwrap();
        metrics.record_request(backend, "a", Duration::from_millis(100), &failed).await.unwrap();
        metrics.record_request(backend, "a", Duration::from_millis(300), &ok).await.unwrap();
        metrics.record_request(backend, "b", Duration::from_millis(200), &ok).await.unwrap();

        let snapshot = metrics.get_metrics(backend).await.unwrap();
        assert_eq!(snapshot.connection_failure, 1);
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.methods.len(), 2);
        assert_eq!(snapshot.methods["a"], 2);
        let times = snapshot.response_times.unwrap();
        assert!((times.min - 0.1).abs() < 1e-9);
        assert!((times.max - 0.3).abs() < 1e-9);
        assert!((times.avg - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_samples_are_capped() {
        let metrics = MetricsCollector::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60), 3);
        let backend = BackendId::new_random();
        let ok = ProviderResponse::success(Value::Null);
        for ms in [100, 200, 300, 400, 500] {
            metrics.record_request(backend, "m", Duration::from_millis(ms), &ok).await.unwrap();
        }
        let times = metrics.get_metrics(backend).await.unwrap().response_times.unwrap();
        assert_eq!(times.samples, 3);
        assert!((times.min - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let snapshot = collector().get_metrics(BackendId::new_random()).await.unwrap();
        assert_eq!(snapshot.request_count, 0);
        assert!(snapshot.methods.is_empty());
        assert!(snapshot.response_times.is_none());
    }
}
