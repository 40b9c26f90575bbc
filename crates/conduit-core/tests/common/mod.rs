//! Shared helpers for Conduit Core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use conduit_abstraction::{Authentication, BackendRecord};
use conduit_core::{GatewayConfig, InMemoryBackendStore, InMemoryCache, Pipeline};
use conduit_providers::ProviderRegistry;
use serde_json::{Map, Value};

/// A pipeline together with the store it persists to.
pub struct TestGateway {
    pub pipeline: Pipeline,
    pub store: Arc<InMemoryBackendStore>,
}

/// Builds a pipeline over fresh in-memory store and cache.
pub fn gateway(config: GatewayConfig) -> TestGateway {
    let store = Arc::new(InMemoryBackendStore::new());
    let registry = Arc::new(ProviderRegistry::with_aliases(config.providers.custom.clone()));
    let pipeline = Pipeline::new(config, registry, store.clone(), Arc::new(InMemoryCache::new()));
    TestGateway { pipeline, store }
}

/// A bearer-authenticated record for `backend_type` at `endpoint`.
pub fn http_record(name: &str, backend_type: &str, endpoint: &str) -> BackendRecord {
    BackendRecord::new(name, backend_type, endpoint)
        .with_authentication(Authentication::Bearer { token: Some("test-token".to_string()) })
}

/// A `mock` record with the given behaviour configuration.
pub fn mock_record(name: &str, configuration: Value) -> BackendRecord {
    let configuration: Map<String, Value> = configuration.as_object().cloned().unwrap_or_default();
    BackendRecord::new(name, "mock", "http://localhost:9000").with_configuration(configuration)
}
