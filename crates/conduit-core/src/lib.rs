//! Conduit Core - the provider dispatch gateway.
//!
//! This crate wires the gateway stages together:
//! - validation and security checks for backends and requests
//! - per-backend rate limiting, retry scheduling and circuit breaking
//! - request/response transformation and metrics
//! - the [`Pipeline`] that drives connect, request and disconnect
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use conduit_core::{GatewayConfig, InMemoryBackendStore, InMemoryCache, Pipeline};
//! use conduit_abstraction::{BackendRecord, ProviderRequest};
//! use conduit_providers::ProviderRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load(None)?;
//!     conduit_core::telemetry::init(&config.logging)?;
//!
//!     let registry = Arc::new(ProviderRegistry::with_aliases(config.providers.custom.clone()));
//!     let pipeline = Pipeline::new(
//!         config,
//!         registry,
//!         Arc::new(InMemoryBackendStore::new()),
//!         Arc::new(InMemoryCache::new()),
//!     );
//!
//!     let record = pipeline
//!         .register_backend(BackendRecord::new("local mock", "mock", "http://localhost:9000"))
//!         .await?;
//!     pipeline.connect(record.id).await?;
//!     let response = pipeline.request_with_retry(record.id, ProviderRequest::new("ping")).await?;
//!     println!("{:?}", response.data);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod hooks;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod rules;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod validation;

pub use cache::{CacheError, CacheUpdate, InMemoryCache, SharedCache};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, Result};
pub use error_handler::{CircuitPolicy, ErrorDisposition, ErrorHandler, RetryPolicy};
pub use hooks::{HookAction, HookDescriptor, HookPoint, HookRunner};
pub use metrics::{MetricsCollector, MetricsSnapshot, ResponseTimes};
pub use pipeline::Pipeline;
pub use rate_limit::{RateDecision, RateLimit, RateLimiter};
pub use rules::{EffectivePolicy, RuleConditions, RuleDescriptor, RuleKind, RulePolicy};
pub use store::{BackendStore, InMemoryBackendStore, StoreError};
pub use transform::{TransformProfile, sanitize_error};
pub use validation::{ConfigValidator, SecurityChecker, ValidationErrors};
