//! Error types for Pictor Core
//!
//! Covers the failures a generation call can surface:
//! - invalid requests or settings, rejected before any resource is touched
//! - every provider denied admission
//! - the critic could not score the image
//! - the caller's deadline ran out
//!
//! Provider failures are not errors here: once every provider has failed
//! the call returns a `FAILED` result instead.

use std::fmt;
use std::time::Duration;

use pictor_artifact::{HashError, ProviderKind, RequestError};
use pictor_cache::CacheError;
use pictor_critic::CritiqueError;
use pictor_resource::DenialReason;
use serde::{Deserialize, Serialize};

/// A provider refused admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDenial {
    pub provider: ProviderKind,
    pub reason: DenialReason,
}

impl fmt::Display for ProviderDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

fn join_denials(denials: &[ProviderDenial]) -> String {
    if denials.is_empty() {
        return "no provider configured".to_string();
    }
    denials
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main Pictor error type
#[derive(Debug, thiserror::Error)]
pub enum PictorError {
    /// Invalid request or configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No provider admitted the request
    #[error("resources exhausted: {}", join_denials(denials))]
    ResourceExhausted { denials: Vec<ProviderDenial> },

    /// The critic could not evaluate the image
    #[error("critique failed: {0}")]
    CritiqueFailure(#[from] CritiqueError),

    /// Cache storage failure; non-fatal during generation
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The caller-imposed deadline elapsed
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] HashError),
}

impl From<RequestError> for PictorError {
    fn from(err: RequestError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl PictorError {
    /// Check if a later identical call might succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::DeadlineExceeded(_) => true,
            Self::CritiqueFailure(e) => e.is_retryable(),
            Self::Configuration(_) | Self::Cache(_) | Self::Fingerprint(_) => false,
        }
    }

    /// Create configuration error
    #[inline]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
