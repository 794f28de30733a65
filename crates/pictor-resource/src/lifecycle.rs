//! Model lifecycle state machine
//!
//! ```text
//! UNLOADED -> LOADING -> LOADED -> UNLOADING -> UNLOADED
//!                |                     |
//!                +-> UNLOADED          +-> LOADED   (failed load / unload)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, ResourceError};

/// Phase of the local model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl LifecyclePhase {
    /// Whether a load or unload is running
    #[inline]
    #[must_use]
    pub const fn is_transitional(&self) -> bool {
        matches!(self, LifecyclePhase::Loading | LifecyclePhase::Unloading)
    }
}

/// Legal successors of `from`
#[must_use]
pub fn allowed_transitions(from: LifecyclePhase) -> &'static [LifecyclePhase] {
    use LifecyclePhase::{Loaded, Loading, Unloaded, Unloading};
    match from {
        Unloaded => &[Loading],
        Loading => &[Loaded, Unloaded],
        Loaded => &[Unloading],
        Unloading => &[Unloaded, Loaded],
    }
}

/// Validates a lifecycle transition.
///
/// # Errors
/// Returns [`ResourceError::IllegalTransition`] if `to` is not a successor of `from`
pub fn validate_transition(from: LifecyclePhase, to: LifecyclePhase) -> Result<(), ResourceError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ResourceError::IllegalTransition { from, to })
    }
}

/// Snapshot of the local model state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelLifecycleState {
    pub phase: LifecyclePhase,
    pub current_model_id: Option<String>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl ModelLifecycleState {
    /// Whether `model_id` is loaded and ready
    #[must_use]
    pub fn is_warm(&self, model_id: &str) -> bool {
        self.phase == LifecyclePhase::Loaded && self.current_model_id.as_deref() == Some(model_id)
    }
}

/// Whatever actually holds model weights on the device
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Load `model_id` onto the device
    async fn load(&self, model_id: &str) -> Result<(), HostError>;

    /// Free `model_id` from the device
    async fn unload(&self, model_id: &str) -> Result<(), HostError>;
}
