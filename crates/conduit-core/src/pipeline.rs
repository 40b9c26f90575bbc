//! The gateway pipeline.
//!
//! [`Pipeline`] owns the live provider sessions and drives every call
//! through the stages in order:
//!
//! ```text
//! connect:  active check -> rate limit -> PRE_CONNECT -> provider.connect
//!           -> status -> metrics -> POST_CONNECT -> persist
//! request:  rate limit -> validation (+ VALIDATION) -> security
//!           -> transform (+ PRE_REQUEST) -> provider.execute_request
//!           -> transform (+ POST_REQUEST) -> ERROR hooks + error handler
//!           -> metrics
//! ```
//!
//! Rejections before the provider surface as [`GatewayError`]s. Anything the
//! provider reports comes back as a [`ProviderResponse`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use conduit_abstraction::{
    BackendId, BackendRecord, BackendStatus, Provider, ProviderError, ProviderRequest,
    ProviderResponse,
};
use conduit_providers::ProviderRegistry;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::error_handler::{ErrorDisposition, ErrorHandler, cooldown_elapsed};
use crate::hooks::{HookPoint, HookRunner};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::rate_limit::{CONNECT, REQUEST, RateDecision, RateLimit, RateLimiter};
use crate::rules::EffectivePolicy;
use crate::store::BackendStore;
use crate::transform::{enforce_response_size, sanitize_error, transform_request, transform_response};
use crate::validation::{ConfigValidator, SecurityChecker, ValidationErrors, validate_request};

/// Routes requests to backends through the gateway stages.
pub struct Pipeline {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn BackendStore>,
    validator: ConfigValidator,
    security: SecurityChecker,
    rate_limiter: RateLimiter,
    error_handler: ErrorHandler,
    metrics: MetricsCollector,
    hooks: HookRunner,
    sessions: RwLock<HashMap<BackendId, Arc<dyn Provider>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline over the given registry, store and cache.
    pub fn new(
        config: GatewayConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn BackendStore>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let validator = ConfigValidator::new(Arc::clone(&registry), &config);
        let security = SecurityChecker::new(config.security.blocked_methods.clone());
        let rate_limiter = RateLimiter::new(Arc::clone(&cache));
        let error_handler = ErrorHandler::new(Arc::clone(&cache), config.features.circuit_breaker);
        let metrics = MetricsCollector::new(
            cache,
            config.metrics_window(),
            config.metrics.max_timing_samples,
        );
        let hooks = HookRunner::new(config.hooks.clone());

        Self {
            config,
            registry,
            store,
            validator,
            security,
            rate_limiter,
            error_handler,
            metrics,
            hooks,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration this pipeline runs with.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The provider catalog.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Runs the record-level checks without saving anything.
    pub async fn validate_backend(&self, record: &BackendRecord) -> ValidationErrors {
        self.validator.validate_backend(record).await
    }

    /// Applies provider defaults, validates and saves a new backend.
    pub async fn register_backend(&self, mut record: BackendRecord) -> Result<BackendRecord> {
        if let Some(defaults) = self.config.providers.defaults.get(&record.backend_type) {
            record.apply_defaults(defaults.endpoint.as_deref(), &defaults.configuration);
        }

        let errors = self.validator.validate_backend(&record).await;
        if !errors.is_empty() {
            return Err(GatewayError::Validation(errors));
        }

        self.store.save_backend(&record).await?;
        info!(backend = %record.name, backend_id = %record.id, backend_type = %record.backend_type, "Registered backend");
        Ok(record)
    }

    /// Opens a provider session for a backend.
    ///
    /// The updated record is persisted whether or not the provider connects.
    pub async fn connect(&self, backend_id: BackendId) -> Result<BackendRecord> {
        let mut record = self.store.load_backend(backend_id).await?;
        if !record.is_active {
            return Err(GatewayError::BackendInactive(backend_id));
        }

        let recovering = record.status == BackendStatus::Error;
        let quarantine = self.config.circuit_breaker.quarantine;
        if recovering && quarantine && !cooldown_elapsed(&record, self.config.circuit_breaker_cooldown()) {
            return Err(GatewayError::Quarantined(backend_id));
        }
        let recovery_attempt = recovering && quarantine;

        let hooks = self.store.load_hooks(backend_id).await?;
        let rules = self.store.load_rules(backend_id).await?;
        let policy = EffectivePolicy::from_config(&self.config).with_rules(&rules, None);

        self.check_rate_limit(backend_id, CONNECT, policy.connect_limit).await?;

        let now = Utc::now();
        record.mark_connect_attempt(now);
        info!(
            backend = %record.name,
            backend_id = %record.id,
            backend_type = %record.backend_type,
            recovery_attempt,
            "Attempting to connect to backend"
        );

        if let Err(e) = self.hooks.pre_connect(&hooks, &record, recovery_attempt) {
            self.store.save_backend(&record).await?;
            return Err(e);
        }

        let outcome = self.open_session(&record).await;
        let now = Utc::now();
        match &outcome {
            Ok(provider) => {
                record.mark_connected(now);
                if recovering {
                    self.error_handler.reset(backend_id).await?;
                    info!(backend = %record.name, backend_id = %record.id, "Backend recovered from ERROR");
                }
                let replaced = self.sessions.write().await.insert(backend_id, Arc::clone(provider));
                if let Some(previous) = replaced {
                    previous.disconnect().await;
                }
                info!(backend = %record.name, backend_id = %record.id, "Connected to backend");
            }
            Err(e) => {
                let message = sanitize_error(&e.to_string());
                record.mark_connect_failed(message.clone(), now);
                if recovery_attempt {
                    record.trip_circuit(now);
                }
                error!(backend = %record.name, backend_id = %record.id, error = %message, "Failed to connect to backend");
            }
        }

        if self.config.features.metrics_collection {
            self.metrics.record_connection(backend_id, outcome.is_ok()).await?;
        }
        self.hooks.post_connect(&hooks, &mut record);
        self.store.save_backend(&record).await?;

        outcome.map(|_| record)
    }

    async fn open_session(&self, record: &BackendRecord) -> Result<Arc<dyn Provider>> {
        let provider = self.registry.create(record).await?;
        provider.connect().await?;
        Ok(provider)
    }

    /// Sends one request to a connected backend.
    ///
    /// A retryable failure leaves `request.context.should_retry` set together
    /// with the backoff in `request.context.retry_delay`.
    pub async fn request(
        &self,
        backend_id: BackendId,
        request: &mut ProviderRequest,
    ) -> Result<ProviderResponse> {
        let mut record = self.store.load_backend(backend_id).await?;
        if !record.is_active {
            return Err(GatewayError::BackendInactive(backend_id));
        }
        if self.config.circuit_breaker.quarantine && record.status == BackendStatus::Error {
            return Err(GatewayError::Quarantined(backend_id));
        }

        request.context.should_retry = false;
        request.context.retry_delay = None;

        let hooks = self.store.load_hooks(backend_id).await?;
        let rules = self.store.load_rules(backend_id).await?;
        let policy = EffectivePolicy::from_config(&self.config).with_rules(&rules, Some(request.method.as_str()));

        self.check_rate_limit(backend_id, REQUEST, policy.request_limit).await?;

        let mut errors = validate_request(request, policy.max_request_bytes);
        errors.extend("hooks", self.hooks.validate(&hooks, &record, request));
        if !errors.is_empty() {
            warn!(backend_id = %backend_id, method = %request.method, errors = %errors, "Request failed validation");
            return Err(GatewayError::Validation(errors));
        }

        let issues = self.security.check_request(request);
        if !issues.is_empty() {
            warn!(backend_id = %backend_id, method = %request.method, issues = ?issues, "Request rejected by security checks");
            return Err(GatewayError::SecurityRejected(issues));
        }

        if self.config.features.request_transformation {
            transform_request(&record.backend_type, request, policy.default_timeout_secs);
        }
        self.hooks.pre_request(&hooks, &record, request);

        let provider = self
            .sessions
            .read()
            .await
            .get(&backend_id)
            .cloned()
            .ok_or(ProviderError::NotConnected)?;

        request.context.request_id = Some(Uuid::new_v4().to_string());
        request.context.timestamp = Some(Utc::now());
        let started = Instant::now();
        debug!(
            backend_id = %backend_id,
            method = %request.method,
            request_id = request.context.request_id.as_deref().unwrap_or_default(),
            retry_count = request.context.retry_count,
            "Dispatching request"
        );

        let response = match provider.execute_request(request.clone()).await {
            Ok(response) => response,
            Err(ProviderError::NotConnected) => return Err(ProviderError::NotConnected.into()),
            Err(e) => ProviderResponse::failure(e.to_string()),
        };

        let mut response = if self.config.features.request_transformation {
            transform_response(&record.backend_type, response, policy.max_response_bytes)
        } else {
            enforce_response_size(response, policy.max_response_bytes)
        };
        self.hooks.on_response(&hooks, HookPoint::PostRequest, &record, &mut response);

        if !response.success {
            self.hooks.on_response(&hooks, HookPoint::Error, &record, &mut response);
            let disposition = self
                .error_handler
                .handle_error(&mut record, &mut request.context, &response, policy.retry, policy.circuit)
                .await?;
            if let ErrorDisposition::Fatal { tripped: true, .. } = disposition {
                if self.config.circuit_breaker.quarantine {
                    self.sessions.write().await.remove(&backend_id);
                }
                self.store.save_backend(&record).await?;
            }
        }

        let elapsed = started.elapsed();
        if self.config.features.metrics_collection {
            self.metrics.record_request(backend_id, &request.method, elapsed, &response).await?;
        }

        if self.config.logging.log_responses {
            debug!(
                backend_id = %backend_id,
                method = %request.method,
                success = response.success,
                error = %response.error.as_deref().map(sanitize_error).unwrap_or_default(),
                duration_ms = elapsed.as_millis() as u64,
                "Response received"
            );
        }
        Ok(response)
    }

    /// Sends a request, resubmitting it while the error handler asks for a retry.
    pub async fn request_with_retry(
        &self,
        backend_id: BackendId,
        mut request: ProviderRequest,
    ) -> Result<ProviderResponse> {
        loop {
            let response = self.request(backend_id, &mut request).await?;
            if !request.context.should_retry {
                return Ok(response);
            }
            let delay = request.context.retry_delay.unwrap_or_default();
            info!(
                backend_id = %backend_id,
                method = %request.method,
                attempt = request.context.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Lists the tools a connected backend exposes.
    ///
    /// Runs `list_tools` through the full request path, retries included.
    pub async fn list_tools(&self, backend_id: BackendId) -> Result<Vec<Value>> {
        self.list(backend_id, "list_tools", "tools").await
    }

    /// Lists the resources a connected backend exposes.
    pub async fn list_resources(&self, backend_id: BackendId) -> Result<Vec<Value>> {
        self.list(backend_id, "list_resources", "resources").await
    }

    async fn list(&self, backend_id: BackendId, method: &str, key: &str) -> Result<Vec<Value>> {
        let response = self.request_with_retry(backend_id, ProviderRequest::new(method)).await?;
        if !response.success {
            let error = response.error.unwrap_or_else(|| "Unknown error".to_string());
            return Err(ProviderError::Request(error).into());
        }
        Ok(response.data.as_ref().and_then(|data| data.get(key)).and_then(Value::as_array).cloned().unwrap_or_default())
    }

    /// Operator deactivation. Closes any open session; an `ACTIVE` backend becomes `INACTIVE`.
    pub async fn deactivate_backend(&self, backend_id: BackendId) -> Result<BackendRecord> {
        let mut record = self.store.load_backend(backend_id).await?;
        record.deactivate();
        let session = self.sessions.write().await.remove(&backend_id);
        if let Some(provider) = session {
            provider.disconnect().await;
            record.mark_disconnected(Utc::now());
        }
        self.store.save_backend(&record).await?;
        info!(backend = %record.name, backend_id = %record.id, status = %record.status, "Deactivated backend");
        Ok(record)
    }

    /// Operator reactivation out of `ERROR`.
    ///
    /// Clears the trip stamp, the error window and the connect rate-limit
    /// counter so the next connect starts fresh.
    pub async fn reactivate_backend(&self, backend_id: BackendId) -> Result<BackendRecord> {
        let mut record = self.store.load_backend(backend_id).await?;
        record.reactivate();
        self.error_handler.reset(backend_id).await?;
        self.rate_limiter.reset(backend_id, CONNECT).await?;
        self.store.save_backend(&record).await?;
        info!(backend = %record.name, backend_id = %record.id, status = %record.status, "Reactivated backend");
        Ok(record)
    }

    /// Closes the backend's provider session, if any.
    pub async fn disconnect(&self, backend_id: BackendId) -> Result<BackendRecord> {
        let mut record = self.store.load_backend(backend_id).await?;
        let session = self.sessions.write().await.remove(&backend_id);
        if let Some(provider) = session {
            provider.disconnect().await;
        }
        record.mark_disconnected(Utc::now());
        self.store.save_backend(&record).await?;
        info!(backend = %record.name, backend_id = %record.id, "Disconnected from backend");
        Ok(record)
    }

    /// Whether a provider session is open for the backend.
    pub async fn is_connected(&self, backend_id: BackendId) -> bool {
        self.sessions.read().await.contains_key(&backend_id)
    }

    /// Reads the backend's metrics.
    pub async fn get_metrics(&self, backend_id: BackendId) -> Result<MetricsSnapshot> {
        Ok(self.metrics.get_metrics(backend_id).await?)
    }

    async fn check_rate_limit(&self, backend_id: BackendId, operation: &str, limit: RateLimit) -> Result<()> {
        if !self.config.features.rate_limiting {
            return Ok(());
        }
        match self.rate_limiter.check_limit(backend_id, operation, Some(limit)).await? {
            RateDecision::Allowed => Ok(()),
            RateDecision::Denied => {
                Err(GatewayError::RateLimited { backend: backend_id, operation: operation.to_string() })
            }
        }
    }
}
