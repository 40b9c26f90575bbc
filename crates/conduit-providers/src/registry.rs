//! Provider registry.
//!
//! Maps a backend type name (`"generic"`, `"claude"`, ...) to the
//! registration that can build a provider for it. A registry is an ordinary
//! value: construct one, wrap it in an `Arc` and hand it to whoever needs it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use conduit_abstraction::{BackendRecord, Provider, ProviderDescriptor, ProviderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info};

use crate::{HttpProvider, MockProvider};

/// Builds a live provider for a backend record.
pub type ProviderConstructor = fn(&BackendRecord) -> std::result::Result<Arc<dyn Provider>, ProviderError>;

/// Errors raised by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A registration does not satisfy the provider contract.
    #[error("Provider '{name}' violates the provider contract: {reason}")]
    ContractViolation {
        /// The type name that was being registered.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No provider is registered under this type name.
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),

    /// The provider constructor failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A provider implementation known to the registry.
#[derive(Clone)]
pub struct ProviderRegistration {
    /// Static description of the implementation.
    pub descriptor: ProviderDescriptor,
    /// Builds an instance for a record.
    pub constructor: ProviderConstructor,
}

impl ProviderRegistration {
    /// Creates a registration.
    pub fn new(descriptor: ProviderDescriptor, constructor: ProviderConstructor) -> Self {
        Self { descriptor, constructor }
    }

    /// Checks the registration against the provider contract.
    fn check_contract(&self) -> std::result::Result<(), String> {
        let descriptor = &self.descriptor;
        if descriptor.name.trim().is_empty() {
            return Err("display name is empty".to_string());
        }
        if descriptor.description.trim().is_empty() {
            return Err("description is empty".to_string());
        }
        if let Err(e) = semver::Version::parse(&descriptor.version) {
            return Err(format!("version '{}' is not a semantic version: {e}", descriptor.version));
        }
        if let Some(field) = descriptor.schema.undeclared_required().first() {
            return Err(format!("required field '{field}' is not declared in properties"));
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Summary returned by [`ProviderRegistry::list_providers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSummary {
    /// Display name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Semantic version.
    pub version: String,
}

/// Built-in provider types. Entries without a constructor are known names
/// whose implementation is not shipped in this build.
const BUILTIN_PROVIDERS: &[(&str, Option<fn() -> ProviderRegistration>)] = &[
    ("generic", Some(HttpProvider::generic_registration)),
    ("claude", Some(HttpProvider::assistant_registration)),
    ("mock", Some(MockProvider::registration)),
    ("filesystem", None),
    ("github", None),
    ("slack", None),
    ("postgres", None),
    ("web_search", None),
];

/// Catalog of provider implementations.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, ProviderRegistration>>,
    /// Extra type names mapped to an already-known registration.
    aliases: BTreeMap<String, String>,
    initialized: OnceCell<()>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("provider_count", &self.providers.try_read().map(|p| p.len()).unwrap_or(0))
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Creates a registry with only the built-in providers.
    pub fn new() -> Self {
        Self::with_aliases(BTreeMap::new())
    }

    /// Creates a registry that also exposes each `alias -> target` pair,
    /// where `target` is a built-in or explicitly registered type.
    pub fn with_aliases(aliases: BTreeMap<String, String>) -> Self {
        Self { providers: RwLock::new(HashMap::new()), aliases, initialized: OnceCell::new() }
    }

    /// Loads built-ins and aliases. Runs once per registry; later calls are no-ops.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                self.load_builtin_providers().await;
                self.load_aliases().await;
                let count = self.providers.read().await.len();
                info!(providers = count, "Initialized provider registry");
            })
            .await;
    }

    async fn load_builtin_providers(&self) {
        for (name, registration) in BUILTIN_PROVIDERS {
            let Some(registration) = registration else {
                debug!(provider = %name, "Built-in provider not available in this build");
                continue;
            };
            if let Err(e) = self.register_provider(name, registration()).await {
                error!(provider = %name, error = %e, "Failed to register built-in provider");
            }
        }
    }

    async fn load_aliases(&self) {
        for (alias, target) in &self.aliases {
            let registration = self.providers.read().await.get(target).cloned();
            match registration {
                Some(registration) => {
                    if let Err(e) = self.register_provider(alias, registration).await {
                        error!(provider = %alias, error = %e, "Failed to register custom provider");
                    }
                }
                None => {
                    error!(provider = %alias, target = %target, "Failed to load custom provider: unknown target");
                }
            }
        }
    }

    /// Registers a provider under `name`, replacing any previous registration.
    ///
    /// # Errors
    /// Returns [`RegistryError::ContractViolation`] if `name` is empty or the
    /// registration's descriptor is incomplete.
    pub async fn register_provider(
        &self,
        name: &str,
        registration: ProviderRegistration,
    ) -> Result<()> {
        let violation = |reason: String| RegistryError::ContractViolation {
            name: name.to_string(),
            reason,
        };
        if name.trim().is_empty() {
            return Err(violation("type name is empty".to_string()));
        }
        registration.check_contract().map_err(violation)?;

        self.providers.write().await.insert(name.to_string(), registration);
        debug!(provider = %name, "Registered provider");
        Ok(())
    }

    /// Looks up the registration for a type name.
    pub async fn get_provider(&self, name: &str) -> Option<ProviderRegistration> {
        self.initialize().await;
        self.providers.read().await.get(name).cloned()
    }

    /// Whether a type name is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.initialize().await;
        self.providers.read().await.contains_key(name)
    }

    /// Lists every registered type with its display name, description and version.
    pub async fn list_providers(&self) -> BTreeMap<String, ProviderSummary> {
        self.initialize().await;
        self.providers
            .read()
            .await
            .iter()
            .map(|(name, registration)| {
                let descriptor = &registration.descriptor;
                (
                    name.clone(),
                    ProviderSummary {
                        name: descriptor.name.clone(),
                        description: descriptor.description.clone(),
                        version: descriptor.version.clone(),
                    },
                )
            })
            .collect()
    }

    /// Builds a live provider for a backend record.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownProvider`] if the record's type is not
    /// registered, or the constructor's error.
    pub async fn create(&self, record: &BackendRecord) -> Result<Arc<dyn Provider>> {
        let registration = self
            .get_provider(&record.backend_type)
            .await
            .ok_or_else(|| RegistryError::UnknownProvider(record.backend_type.clone()))?;
        Ok((registration.constructor)(record)?)
    }
}
