//! Resource errors

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecyclePhase;

/// Failure to sample the device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe i/o error: {0}")]
    Io(String),

    #[error("probe command failed (status {status:?}): {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },

    #[error("unparsable probe output: {0}")]
    Parse(String),
}

/// Why admission was refused
///
/// Denials are expected outcomes, not faults: the orchestrator reacts to
/// them by trying the next provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DenialReason {
    /// No slot became free within the admission timeout
    #[error("no local slot became free in time")]
    AdmissionTimeout,

    /// A model load or unload is in progress
    #[error("model transition in flight")]
    TransitionInFlight,

    /// Sampling failed; the device is treated as full
    #[error("vram sampling failed: {0}")]
    ProbeFailed(String),

    /// CPU-only host
    #[error("no gpu device present")]
    NoDevice,

    /// `free_mb - safety_margin_mb < estimated_mb`
    #[error("insufficient vram: {available_mb} MiB available, {estimated_mb} MiB needed")]
    InsufficientVram { available_mb: u64, estimated_mb: u64 },

    /// The manager has been shut down
    #[error("resource manager shut down")]
    ShutDown,

    /// Provider lacks credentials or an endpoint
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

/// Error reported by a model host
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The device refused the allocation
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Host could not be reached
    #[error("host unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl HostError {
    /// Whether the device ran out of memory
    #[inline]
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, HostError::OutOfMemory(_))
    }
}

/// Resource manager errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("illegal lifecycle transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("failed to load model {model_id}: {source}")]
    ModelLoad {
        model_id: String,
        #[source]
        source: HostError,
    },

    #[error("failed to unload model {model_id}: {source}")]
    ModelUnload {
        model_id: String,
        #[source]
        source: HostError,
    },

    /// Grant was issued by another manager
    #[error("slot grant does not belong to this manager")]
    ForeignGrant,

    #[error("resource manager shut down")]
    ShutDown,
}

impl ResourceError {
    /// Whether the failure was the device running out of memory
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            ResourceError::ModelLoad { source, .. } | ResourceError::ModelUnload { source, .. } => {
                source.is_out_of_memory()
            }
            _ => false,
        }
    }
}
