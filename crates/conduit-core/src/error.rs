//! Error types for Conduit Core.

use conduit_abstraction::{BackendId, ProviderError};
use conduit_providers::RegistryError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::validation::ValidationErrors;

/// Core error type for gateway operations.
///
/// Remote failures during a request are not errors: they come back as a
/// failed `ProviderResponse`. These variants cover everything that stops a
/// call before or around the provider.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The backend record or request failed validation.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// A per-backend rate limit was exhausted.
    #[error("Rate limit exceeded for backend {backend} ({operation})")]
    RateLimited {
        /// The backend that was limited.
        backend: BackendId,
        /// The operation class (`connect` or `request`).
        operation: String,
    },

    /// The request was rejected by the security checks.
    #[error("Security check failed: {}", .0.join(", "))]
    SecurityRejected(Vec<String>),

    /// The backend is administratively disabled.
    #[error("Backend {0} is not active")]
    BackendInactive(BackendId),

    /// The backend is in `ERROR` and no recovery attempt is due.
    #[error("Backend {0} is in ERROR state and must be reactivated")]
    Quarantined(BackendId),

    /// A hook refused to let the call continue.
    #[error("Hook '{hook}' rejected the call: {reason}")]
    HookRejected {
        /// Name of the hook.
        hook: String,
        /// Why it refused.
        reason: String,
    },

    /// The provider failed to connect or was not connected.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The provider type could not be resolved.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The backend store failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// The shared cache failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_conversion() {
        let err: GatewayError = ProviderError::NotConnected.into();
        match err {
            GatewayError::Provider(ProviderError::NotConnected) => {}
            _ => panic!("Expected Provider error variant"),
        }
    }

    #[test]
    fn test_security_rejected_display() {
        let err = GatewayError::SecurityRejected(vec![
            "Method 'shutdown' is blocked".to_string(),
            "Potential SQL injection detected: UNION SELECT".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Security check failed: Method 'shutdown' is blocked, Potential SQL injection detected: UNION SELECT"
        );
    }

    #[test]
    fn test_rate_limited_display() {
        let backend = BackendId::new_random();
        let err = GatewayError::RateLimited { backend, operation: "connect".to_string() };
        assert_eq!(err.to_string(), format!("Rate limit exceeded for backend {backend} (connect)"));
    }
}
