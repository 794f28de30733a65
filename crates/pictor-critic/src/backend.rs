//! Scoring backends
//!
//! A backend is the opaque capability that looks at pixels. It may answer
//! with fractional or out-of-range numbers; [`crate::QualityCritic`]
//! normalizes them.

use std::time::Duration;

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use pictor_artifact::ImageArtifact;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CritiqueError;

/// Unnormalized scores as reported by a backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawScores {
    pub sharpness: f64,
    pub composition: f64,
    pub no_text: f64,
    pub coherence: f64,
    pub professionalism: f64,
    #[serde(default)]
    pub has_unwanted_text: bool,
    #[serde(default)]
    pub problems: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl RawScores {
    #[must_use]
    pub fn new(
        sharpness: f64,
        composition: f64,
        no_text: f64,
        coherence: f64,
        professionalism: f64,
    ) -> Self {
        Self {
            sharpness,
            composition,
            no_text,
            coherence,
            professionalism,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_unwanted_text(mut self, detected: bool) -> Self {
        self.has_unwanted_text = detected;
        self
    }

    #[must_use]
    pub fn with_problem(mut self, problem: impl Into<String>) -> Self {
        self.problems.push(problem.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Looks at an image and reports raw scores
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    /// Score `image`, generated for `prompt`
    async fn score(&self, image: &ImageArtifact, prompt: &str) -> Result<RawScores, CritiqueError>;
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    image: String,
    media_type: &'static str,
    prompt: &'a str,
}

/// Client for a vision scoring service
///
/// `POST {endpoint}/v1/critique` with `{image, media_type, prompt}`,
/// answered by a [`RawScores`] JSON document.
#[derive(Debug, Clone)]
pub struct HttpScoringBackend {
    client: Client,
    endpoint: String,
}

impl HttpScoringBackend {
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ScoringBackend for HttpScoringBackend {
    async fn score(&self, image: &ImageArtifact, prompt: &str) -> Result<RawScores, CritiqueError> {
        let url = format!("{}/v1/critique", self.endpoint);
        let body = ScoreRequest {
            image: BASE64_STANDARD.encode(image.bytes()),
            media_type: image.media_type().mime(),
            prompt,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CritiqueError::BackendUnreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(CritiqueError::BackendUnreachable(format!("{status}: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CritiqueError::MalformedResponse(format!(
                "{status}: {text}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CritiqueError::BackendUnreachable(e.to_string()))?;
        debug!(bytes = text.len(), "scoring response received");
        serde_json::from_str(&text).map_err(|e| CritiqueError::MalformedResponse(e.to_string()))
    }
}
