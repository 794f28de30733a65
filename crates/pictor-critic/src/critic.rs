//! Quality critic
//!
//! Normalizes a backend's raw scores into a [`CritiqueResult`]:
//! round, clamp to `0..=10`, cap `no_text` when text was detected, then
//! derive problems and suggestions for every weak criterion.

use std::sync::Arc;
use std::time::Duration;

use pictor_artifact::ImageArtifact;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{RawScores, ScoringBackend};
use crate::error::CritiqueError;
use crate::score::{
    Criterion, CriterionScores, CritiqueResult, DEFAULT_THRESHOLD, MAX_CRITERION_SCORE,
};

/// Criteria below this are reported as problems
pub const WEAK_SCORE: u8 = 5;

/// Ceiling on `no_text` when unwanted text was detected
pub const TEXT_DETECTED_NO_TEXT_CAP: u8 = 5;

/// Critic configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    /// Minimum total (out of 50) for a `VALID` verdict
    pub threshold: u8,
    /// Base URL of the scoring service
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            endpoint: "http://127.0.0.1:8001".to_string(),
            timeout_secs: 60,
        }
    }
}

impl CriticConfig {
    #[must_use]
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scores candidate images and issues a verdict
#[derive(Clone)]
pub struct QualityCritic {
    threshold: u8,
    backend: Arc<dyn ScoringBackend>,
}

impl std::fmt::Debug for QualityCritic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityCritic")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl QualityCritic {
    #[must_use]
    pub fn new(threshold: u8, backend: Arc<dyn ScoringBackend>) -> Self {
        Self { threshold, backend }
    }

    #[inline]
    #[must_use]
    pub const fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Score `image` against the prompt it was generated from
    ///
    /// # Errors
    /// [`CritiqueError::BackendUnreachable`] when the backend cannot be
    /// reached, [`CritiqueError::MalformedResponse`] when it reports
    /// non-finite scores or garbage. Never falls back to a neutral score.
    pub async fn evaluate(
        &self,
        image: &ImageArtifact,
        prompt: &str,
    ) -> Result<CritiqueResult, CritiqueError> {
        let raw = self.backend.score(image, prompt).await?;
        let result = normalize(raw, self.threshold)?;
        info!(
            image = %image.hash().short(),
            score_total = result.score_total,
            verdict = %result.verdict,
            unwanted_text = result.has_unwanted_text,
            "image critiqued"
        );
        Ok(result)
    }
}

fn to_score(criterion: Criterion, value: f64) -> Result<u8, CritiqueError> {
    if !value.is_finite() {
        return Err(CritiqueError::MalformedResponse(format!(
            "{criterion} score is not a number: {value}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = value.round().clamp(0.0, f64::from(MAX_CRITERION_SCORE)) as u8;
    Ok(score)
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// Turn raw backend output into a result honoring every score invariant
///
/// # Errors
/// [`CritiqueError::MalformedResponse`] if any score is NaN or infinite
pub fn normalize(raw: RawScores, threshold: u8) -> Result<CritiqueResult, CritiqueError> {
    let mut no_text = to_score(Criterion::NoText, raw.no_text)?;
    if raw.has_unwanted_text {
        no_text = no_text.min(TEXT_DETECTED_NO_TEXT_CAP);
    }
    let scores = CriterionScores::new(
        to_score(Criterion::Sharpness, raw.sharpness)?,
        to_score(Criterion::Composition, raw.composition)?,
        no_text,
        to_score(Criterion::Coherence, raw.coherence)?,
        to_score(Criterion::Professionalism, raw.professionalism)?,
    );

    let mut problems = raw.problems;
    let mut suggestions = raw.suggestions;
    if raw.has_unwanted_text {
        push_unique(&mut problems, "unwanted text detected in image");
        push_unique(&mut suggestions, Criterion::NoText.remedy());
    }
    for (criterion, score) in scores.iter() {
        if score < WEAK_SCORE {
            push_unique(&mut problems, &format!("{criterion} scored {score}/10"));
            push_unique(&mut suggestions, criterion.remedy());
        }
    }
    debug!(?scores, problems = problems.len(), "scores normalized");

    Ok(CritiqueResult::new(
        scores,
        raw.has_unwanted_text,
        threshold,
        problems,
        suggestions,
    ))
}
