//! Core types: attempts, statuses and results

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pictor_artifact::{ContentHash, Fingerprint, ImageArtifact, ProviderKind};
use pictor_critic::CritiqueResult;
use pictor_providers::{ProviderFailure, ProviderMetadata};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Terminal status of a generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    /// Accepted by the critic
    Validated,
    /// Every admitted provider failed
    Failed,
    /// Retries ran out; the best-scoring attempt is returned
    MaxRetriesExceeded,
    /// Generated but the critic could not score it
    Unevaluated,
}

impl GenerationStatus {
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Validated)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validated => "VALIDATED",
            Self::Failed => "FAILED",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::Unevaluated => "UNEVALUATED",
        })
    }
}

/// One provider invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// 1-based quality attempt this invocation belongs to
    pub attempt_number: u32,
    pub provider_used: ProviderKind,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Content hash of the produced image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output_ref: Option<ContentHash>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ProviderFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_total: Option<u8>,
}

/// Outcome of a generation call
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub id: Ulid,
    pub success: bool,
    pub final_status: GenerationStatus,
    #[serde(skip)]
    pub image: Option<ImageArtifact>,
    /// Where the image lives on disk, when cached
    pub image_path: Option<PathBuf>,
    pub image_hash: Option<ContentHash>,
    pub prompt_used: String,
    pub negative_prompt_used: Option<String>,
    pub critique: Option<CritiqueResult>,
    pub retry_count: u32,
    #[serde(rename = "generation_time_seconds", with = "duration_secs")]
    pub generation_time: Duration,
    pub message: String,
    /// Problems of the last critique, if any
    pub problems: Vec<String>,
    pub provider: Option<ProviderKind>,
    pub provider_metadata: Option<ProviderMetadata>,
    pub attempts: Vec<GenerationAttempt>,
    pub fingerprint: Fingerprint,
    pub from_cache: bool,
}

impl GenerationResult {
    #[inline]
    #[must_use]
    pub fn generation_time_seconds(&self) -> f64 {
        self.generation_time.as_secs_f64()
    }

    #[inline]
    #[must_use]
    pub fn score_total(&self) -> Option<u8> {
        self.critique.as_ref().map(|c| c.score_total)
    }
}

/// What the cache remembers besides the image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CachedGeneration {
    pub(crate) prompt_used: String,
    #[serde(default)]
    pub(crate) negative_prompt_used: Option<String>,
    #[serde(default)]
    pub(crate) critique: Option<CritiqueResult>,
    #[serde(default)]
    pub(crate) provider: Option<ProviderKind>,
    #[serde(default)]
    pub(crate) provider_metadata: Option<ProviderMetadata>,
    #[serde(default)]
    pub(crate) retry_count: u32,
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_wire_format() {
        for status in [
            GenerationStatus::Validated,
            GenerationStatus::Failed,
            GenerationStatus::MaxRetriesExceeded,
            GenerationStatus::Unevaluated,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.to_string());
        }
        assert!(GenerationStatus::Validated.is_success());
        assert!(!GenerationStatus::Unevaluated.is_success());
    }

    #[test]
    fn attempt_duration_is_seconds() {
        let attempt = GenerationAttempt {
            attempt_number: 1,
            provider_used: ProviderKind::Remote,
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            raw_output_ref: None,
            succeeded: false,
            failure: None,
            score_total: None,
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["duration"], 1.5);
        let back: GenerationAttempt = serde_json::from_value(json).unwrap();
        assert_eq!(back, attempt);
    }
}
