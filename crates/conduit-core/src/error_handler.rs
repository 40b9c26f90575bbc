//! Failure classification, retry scheduling and circuit breaking.
//!
//! A failed response is either retryable (transient transport or upstream
//! trouble) or fatal. Retryable failures are annotated on the request
//! context so the caller can resubmit after a backoff. Fatal failures and
//! exhausted retries count towards the backend's error window; reaching the
//! threshold quarantines the backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conduit_abstraction::{BackendId, BackendRecord, BackendStatus, ProviderResponse, RequestContext};
use serde_json::Value;
use tracing::{error, warn};

use crate::cache::{Result, SharedCache};

/// Substrings (lowercase) that mark an error as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection reset",
    "temporary failure",
    "rate limit",
    "503",
    "502",
    "504",
];

/// Upper bound for a computed backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// How many times to retry and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries scheduled before a failure becomes fatal.
    pub max_retries: u32,
    /// Retry `n` waits `backoff_factor ^ n` seconds.
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Backoff before the retry that follows attempt `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.backoff_factor.powi(exponent))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// When to trip a backend into `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPolicy {
    /// Fatal errors inside the window that trip the breaker.
    pub error_threshold: u64,
    /// Error window length; re-armed by every fatal error.
    pub window: Duration,
}

/// What the handler decided for a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The context was marked for a retry after `delay`.
    Retry {
        /// Retry number now scheduled (1-based).
        attempt: u32,
        /// Backoff to honour.
        delay: Duration,
    },
    /// The failure counted towards the error window.
    Fatal {
        /// Errors in the current window, including this one.
        error_count: u64,
        /// Whether this failure tripped the breaker.
        tripped: bool,
    },
    /// The failure was fatal but circuit breaking is switched off.
    Untracked,
}

/// Whether an error message describes a transient failure.
pub fn is_retryable(error: Option<&str>) -> bool {
    let Some(error) = error else {
        return false;
    };
    let error = error.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|pattern| error.contains(pattern))
}

fn circuit_key(backend: BackendId) -> String {
    format!("circuit_breaker:{backend}")
}

/// Classifies failures and maintains per-backend error windows.
#[derive(Clone)]
pub struct ErrorHandler {
    cache: Arc<dyn SharedCache>,
    circuit_enabled: bool,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler").field("circuit_enabled", &self.circuit_enabled).finish_non_exhaustive()
    }
}

impl ErrorHandler {
    /// Creates a handler keeping error windows in `cache`.
    pub fn new(cache: Arc<dyn SharedCache>, circuit_enabled: bool) -> Self {
        Self { cache, circuit_enabled }
    }

    /// Handles one failed response.
    ///
    /// Mutates `context` for retries and `record` when the breaker trips.
    /// The response itself is never changed.
    pub async fn handle_error(
        &self,
        record: &mut BackendRecord,
        context: &mut RequestContext,
        response: &ProviderResponse,
        retry: RetryPolicy,
        circuit: CircuitPolicy,
    ) -> Result<ErrorDisposition> {
        let message = response.error.as_deref();

        if is_retryable(message) && context.retry_count < retry.max_retries {
            let previous = context.retry_count;
            let delay = retry.delay(previous);
            context.retry_count = previous + 1;
            context.should_retry = true;
            context.retry_delay = Some(delay);

            warn!(
                backend = %record.name,
                backend_id = %record.id,
                attempt = previous + 1,
                max_retries = retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = message.unwrap_or_default(),
                "Retryable error"
            );
            return Ok(ErrorDisposition::Retry { attempt: previous + 1, delay });
        }

        context.should_retry = false;
        context.retry_delay = None;
        error!(
            backend = %record.name,
            backend_id = %record.id,
            error = message.unwrap_or("Unknown error"),
            "Non-retryable error"
        );

        if !self.circuit_enabled {
            return Ok(ErrorDisposition::Untracked);
        }
        self.check_circuit_breaker(record, circuit).await
    }

    async fn check_circuit_breaker(
        &self,
        record: &mut BackendRecord,
        circuit: CircuitPolicy,
    ) -> Result<ErrorDisposition> {
        let error_count = self.cache.increment(&circuit_key(record.id), circuit.window).await?;

        let tripped =
            error_count >= circuit.error_threshold && record.status != BackendStatus::Error;
        if tripped {
            error!(
                backend = %record.name,
                backend_id = %record.id,
                error_count,
                window_secs = circuit.window.as_secs(),
                "Circuit breaker triggered"
            );
            record.trip_circuit(Utc::now());
        }
        Ok(ErrorDisposition::Fatal { error_count, tripped })
    }

    /// Errors counted in the backend's current window.
    pub async fn error_count(&self, backend: BackendId) -> Result<u64> {
        let value = self.cache.get(&circuit_key(backend)).await?;
        Ok(value.as_ref().and_then(Value::as_u64).unwrap_or(0))
    }

    /// Clears the backend's error window.
    pub async fn reset(&self, backend: BackendId) -> Result<()> {
        self.cache.delete(&circuit_key(backend)).await
    }
}

/// Whether a tripped backend has cooled down long enough to be retried.
pub fn cooldown_elapsed(record: &BackendRecord, cooldown: Option<Duration>) -> bool {
    let (Some(cooldown), Some(tripped_at)) = (cooldown, record.metadata.circuit_breaker_tripped_at)
    else {
        return false;
    };
    if record.status != BackendStatus::Error {
        return false;
    }
    let elapsed = Utc::now().signed_duration_since(tripped_at);
    elapsed.to_std().is_ok_and(|elapsed| elapsed >= cooldown)
}
