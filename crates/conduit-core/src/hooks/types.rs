//! Core types for the hooks system.

use chrono::{DateTime, Utc};
use conduit_abstraction::BackendId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle point a hook attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookPoint {
    /// Before the provider connects.
    PreConnect,
    /// After a connect attempt, successful or not.
    PostConnect,
    /// Before a request is dispatched, after validation.
    PreRequest,
    /// After a response has been transformed.
    PostRequest,
    /// When a response reports failure.
    Error,
    /// During request validation.
    Validation,
}

impl HookPoint {
    /// Get the string representation of the hook point.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreConnect => "PRE_CONNECT",
            Self::PostConnect => "POST_CONNECT",
            Self::PreRequest => "PRE_REQUEST",
            Self::PostRequest => "POST_REQUEST",
            Self::Error => "ERROR",
            Self::Validation => "VALIDATION",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    /// Add request params that are not already present.
    DefaultParams {
        /// Params to add.
        params: Map<String, Value>,
    },
    /// Reject requests for any of these methods.
    BlockMethods {
        /// Methods to reject.
        methods: Vec<String>,
    },
    /// Reject requests missing any of these params.
    RequireParams {
        /// Params that must be present.
        params: Vec<String>,
    },
    /// Merge values into backend or response metadata.
    Annotate {
        /// Values to merge.
        values: Map<String, Value>,
    },
    /// Emit an informational log event.
    Log {
        /// Message to log.
        message: String,
    },
    /// Refuse to connect a backend that is `INACTIVE` or in `ERROR`.
    RequireActive,
}

impl HookAction {
    /// Short name of the action, as used in the `action` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DefaultParams { .. } => "default_params",
            Self::BlockMethods { .. } => "block_methods",
            Self::RequireParams { .. } => "require_params",
            Self::Annotate { .. } => "annotate",
            Self::Log { .. } => "log",
            Self::RequireActive => "require_active",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A named hook attached to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDescriptor {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning backend.
    pub backend_id: BackendId,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle point.
    pub point: HookPoint,
    /// Execution order; lower values run first.
    #[serde(default)]
    pub priority: i32,
    /// Inactive hooks are skipped.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Behaviour.
    pub action: HookAction,
    /// Creation time; breaks priority ties.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl HookDescriptor {
    /// Creates an active hook with priority 0.
    pub fn new(
        backend_id: BackendId,
        name: impl Into<String>,
        point: HookPoint,
        action: HookAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id,
            name: name.into(),
            point,
            priority: 0,
            is_active: true,
            action,
            created_at: Utc::now(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
