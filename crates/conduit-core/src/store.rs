//! Backend persistence boundary.
//!
//! The gateway never owns storage. It reads and writes backend records,
//! hooks and rules through [`BackendStore`]; [`InMemoryBackendStore`] is the
//! implementation used in tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use conduit_abstraction::{BackendId, BackendRecord};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::hooks::HookDescriptor;
use crate::rules::RuleDescriptor;

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No backend with this id exists.
    #[error("Backend not found: {0}")]
    NotFound(BackendId),

    /// Another backend already uses this name for the same owner.
    #[error("Backend name '{0}' is already in use")]
    DuplicateName(String),

    /// The storage engine failed.
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for backend records and their hooks and rules.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Loads one backend.
    async fn load_backend(&self, id: BackendId) -> Result<BackendRecord>;

    /// Inserts or replaces a backend.
    async fn save_backend(&self, record: &BackendRecord) -> Result<()>;

    /// Deletes a backend together with its hooks and rules.
    async fn delete_backend(&self, id: BackendId) -> Result<()>;

    /// Lists every backend.
    async fn list_backends(&self) -> Result<Vec<BackendRecord>>;

    /// Loads the hooks attached to a backend, in insertion order.
    async fn load_hooks(&self, id: BackendId) -> Result<Vec<HookDescriptor>>;

    /// Inserts or replaces a hook.
    async fn save_hook(&self, hook: &HookDescriptor) -> Result<()>;

    /// Loads the rules attached to a backend, in insertion order.
    async fn load_rules(&self, id: BackendId) -> Result<Vec<RuleDescriptor>>;

    /// Inserts or replaces a rule.
    async fn save_rule(&self, rule: &RuleDescriptor) -> Result<()>;
}

#[derive(Debug, Default)]
struct StoredBackend {
    record: Option<BackendRecord>,
    hooks: Vec<HookDescriptor>,
    rules: Vec<RuleDescriptor>,
}

/// In-process [`BackendStore`].
#[derive(Debug, Default)]
pub struct InMemoryBackendStore {
    backends: RwLock<HashMap<BackendId, StoredBackend>>,
}

impl InMemoryBackendStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, id: Uuid, id_of: impl Fn(&T) -> Uuid) {
    match items.iter_mut().find(|existing| id_of(existing) == id) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[async_trait]
impl BackendStore for InMemoryBackendStore {
    async fn load_backend(&self, id: BackendId) -> Result<BackendRecord> {
        self.backends
            .read()
            .await
            .get(&id)
            .and_then(|stored| stored.record.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn save_backend(&self, record: &BackendRecord) -> Result<()> {
        let mut backends = self.backends.write().await;
        let clash = backends.values().filter_map(|stored| stored.record.as_ref()).any(|other| {
            other.id != record.id && other.owner == record.owner && other.name == record.name
        });
        if clash {
            return Err(StoreError::DuplicateName(record.name.clone()));
        }

        backends.entry(record.id).or_default().record = Some(record.clone());
        debug!(backend_id = %record.id, status = %record.status, "Saved backend");
        Ok(())
    }

    async fn delete_backend(&self, id: BackendId) -> Result<()> {
        match self.backends.write().await.remove(&id) {
            Some(StoredBackend { record: Some(_), hooks, rules }) => {
                debug!(backend_id = %id, hooks = hooks.len(), rules = rules.len(), "Deleted backend");
                Ok(())
            }
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn list_backends(&self) -> Result<Vec<BackendRecord>> {
        let backends = self.backends.read().await;
        let mut records: Vec<BackendRecord> =
            backends.values().filter_map(|stored| stored.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn load_hooks(&self, id: BackendId) -> Result<Vec<HookDescriptor>> {
        let backends = self.backends.read().await;
        match backends.get(&id) {
            Some(stored) if stored.record.is_some() => Ok(stored.hooks.clone()),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn save_hook(&self, hook: &HookDescriptor) -> Result<()> {
        let mut backends = self.backends.write().await;
        let stored = backends
            .get_mut(&hook.backend_id)
            .filter(|stored| stored.record.is_some())
            .ok_or(StoreError::NotFound(hook.backend_id))?;
        upsert(&mut stored.hooks, hook.clone(), hook.id, |h| h.id);
        Ok(())
    }

    async fn load_rules(&self, id: BackendId) -> Result<Vec<RuleDescriptor>> {
        let backends = self.backends.read().await;
        match backends.get(&id) {
            Some(stored) if stored.record.is_some() => Ok(stored.rules.clone()),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn save_rule(&self, rule: &RuleDescriptor) -> Result<()> {
        let mut backends = self.backends.write().await;
        let stored = backends
            .get_mut(&rule.backend_id)
            .filter(|stored| stored.record.is_some())
            .ok_or(StoreError::NotFound(rule.backend_id))?;
        upsert(&mut stored.rules, rule.clone(), rule.id, |r| r.id);
        Ok(())
    }
}
