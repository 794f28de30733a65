//! Provider contract
//!
//! Every provider is admitted first ([`ImageProvider::admit`]) and then
//! asked to generate with the lease it was given. Failures of every
//! provider are folded into one tagged [`ProviderFailure`] so retry logic
//! never needs to know which backend produced them.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pictor_artifact::{GenerationRequest, ImageArtifact, ProviderKind};
use pictor_resource::{DenialReason, SlotGrant};
use serde::{Deserialize, Serialize};

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Device refused an allocation mid-run
    OutOfMemory,
    /// Connection, rate limit or server-side error
    Network,
    /// Provider exceeded its time budget
    Timeout,
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::OutOfMemory => "out of memory",
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::Unknown => "unknown",
        })
    }
}

/// A provider failed to produce an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{provider} provider failed ({kind}): {message}")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub provider: ProviderKind,
    pub message: String,
}

impl ProviderFailure {
    /// Create a failure
    #[must_use]
    pub fn new(kind: FailureKind, provider: ProviderKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn out_of_memory(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(FailureKind::OutOfMemory, provider, message)
    }

    #[must_use]
    pub fn network(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, provider, message)
    }

    #[must_use]
    pub fn timeout(provider: ProviderKind, after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            provider,
            format!("no result within {after:?}"),
        )
    }

    #[must_use]
    pub fn unknown(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, provider, message)
    }

    /// Whether the device ran out of memory
    #[inline]
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.kind == FailureKind::OutOfMemory
    }

    /// Whether the same call might succeed if repeated
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, FailureKind::Network | FailureKind::Timeout)
    }
}

/// What a provider reports alongside the image
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Vendor-assigned request or job id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Prompt after vendor-side rewriting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderMetadata {
    /// Metadata for `model`
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// With an extra key
    #[must_use]
    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Uniform provider output
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub provider: ProviderKind,
    pub image: ImageArtifact,
    pub metadata: ProviderMetadata,
}

/// Admission granted to a provider for one generation
///
/// Dropping a `Local` lease releases the device slot.
#[derive(Debug)]
pub enum ProviderLease {
    /// Holds a local device slot
    Local(SlotGrant),
    /// No shared resource is metered
    Unmetered,
}

/// A capability turning a request into an image
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Which provider this is
    fn kind(&self) -> ProviderKind;

    /// Budget for one [`generate`](Self::generate) call
    fn timeout(&self) -> Duration;

    /// Ask for admission
    async fn admit(&self, request: &GenerationRequest) -> Result<ProviderLease, DenialReason>;

    /// Generate one image under `lease`
    async fn generate(
        &self,
        request: &GenerationRequest,
        lease: ProviderLease,
    ) -> Result<ProviderOutput, ProviderFailure>;

    /// Release anything held across requests
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ProviderFailure::network(ProviderKind::Remote, "503").is_transient());
        assert!(ProviderFailure::timeout(ProviderKind::Local, Duration::from_secs(1)).is_transient());
        assert!(!ProviderFailure::out_of_memory(ProviderKind::Local, "cuda").is_transient());
        assert!(!ProviderFailure::unknown(ProviderKind::Remote, "bad").is_transient());
    }

    #[test]
    fn failure_message() {
        let f = ProviderFailure::out_of_memory(ProviderKind::Local, "CUDA out of memory");
        assert_eq!(
            f.to_string(),
            "local provider failed (out of memory): CUDA out of memory"
        );
    }
}
