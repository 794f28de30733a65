//! Persistence hook
//!
//! The orchestrator hands every terminal result to an optional
//! [`ResultSink`] as a flat [`GenerationRecord`]. Storage schema is the
//! sink's business; sink failures are logged, never propagated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pictor_artifact::{ContentHash, Fingerprint, GenerationRequest, ProviderKind};
use pictor_critic::{CriterionScores, Verdict};
use pictor_providers::ProviderMetadata;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::PictorError;
use crate::types::{GenerationResult, GenerationStatus};

/// Sink failure
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything an external store needs to record one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Ulid,
    pub fingerprint: Fingerprint,
    pub status: GenerationStatus,
    pub image_path: Option<PathBuf>,
    pub image_hash: Option<ContentHash>,
    pub prompt_used: String,
    pub negative_prompt_used: Option<String>,
    pub scores: Option<CriterionScores>,
    pub score_total: Option<u8>,
    pub verdict: Option<Verdict>,
    pub has_unwanted_text: Option<bool>,
    pub provider: Option<ProviderKind>,
    pub provider_metadata: Option<ProviderMetadata>,
    pub retry_count: u32,
    pub generation_time_seconds: f64,
    pub from_cache: bool,
    pub message: String,
    /// Set when the call ended in an error instead of a result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl GenerationRecord {
    /// Record for a call that ended in `error` before producing a result
    #[must_use]
    pub fn rejected(
        fingerprint: Fingerprint,
        request: &GenerationRequest,
        error: &PictorError,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: Ulid::new(),
            fingerprint,
            status: GenerationStatus::Failed,
            image_path: None,
            image_hash: None,
            prompt_used: request.prompt.clone(),
            negative_prompt_used: request.negative_prompt.clone(),
            scores: None,
            score_total: None,
            verdict: None,
            has_unwanted_text: None,
            provider: None,
            provider_metadata: None,
            retry_count: 0,
            generation_time_seconds: elapsed.as_secs_f64(),
            from_cache: false,
            message: error.to_string(),
            error: Some(error.to_string()),
            recorded_at: Utc::now(),
        }
    }
}

impl From<&GenerationResult> for GenerationRecord {
    fn from(result: &GenerationResult) -> Self {
        let critique = result.critique.as_ref();
        Self {
            id: result.id,
            fingerprint: result.fingerprint,
            status: result.final_status,
            image_path: result.image_path.clone(),
            image_hash: result.image_hash,
            prompt_used: result.prompt_used.clone(),
            negative_prompt_used: result.negative_prompt_used.clone(),
            scores: critique.map(|c| c.scores),
            score_total: critique.map(|c| c.score_total),
            verdict: critique.map(|c| c.verdict),
            has_unwanted_text: critique.map(|c| c.has_unwanted_text),
            provider: result.provider,
            provider_metadata: result.provider_metadata.clone(),
            retry_count: result.retry_count,
            generation_time_seconds: result.generation_time_seconds(),
            from_cache: result.from_cache,
            message: result.message.clone(),
            error: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Receives a record for every terminal result
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, record: &GenerationRecord) -> Result<(), SinkError>;
}

/// Appends records to a JSON Lines file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn record(&self, record: &GenerationRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let io = |source: std::io::Error| SinkError::Io {
            path: self.path.clone(),
            source,
        };
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io)?;
        file.write_all(&line).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        Ok(())
    }
}
