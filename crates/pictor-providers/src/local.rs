//! Local diffusion provider
//!
//! Runs a diffusion model on the local GPU through a [`DiffusionBackend`].
//! Admission goes through the [`ResourceManager`]; the model is loaded
//! (or kept warm) under the granted slot before each run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use pictor_artifact::{GenerationRequest, ImageArtifact, ProviderKind};
use pictor_resource::{DenialReason, HostError, ModelHost, ResourceError, ResourceManager};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provider::{
    ImageProvider, ProviderFailure, ProviderLease, ProviderMetadata, ProviderOutput,
};

/// Local provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    pub enabled: bool,
    /// Model identifier/variant loaded on the worker
    pub model_id: String,
    /// Base URL of the GPU worker
    pub endpoint: String,
    /// Resident weights, charged only when the model is not already warm
    pub model_footprint_mb: u64,
    /// Working memory per megapixel of output
    pub mb_per_megapixel: u64,
    pub timeout_secs: u64,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_id: "flux.1-schnell".to_string(),
            endpoint: "http://127.0.0.1:8000".to_string(),
            model_footprint_mb: 12_000,
            mb_per_megapixel: 2_500,
            timeout_secs: 300,
        }
    }
}

impl LocalProviderConfig {
    /// Per-generation timeout
    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// VRAM needed to run `request`
    #[must_use]
    pub fn estimate_mb(&self, request: &GenerationRequest, warm: bool) -> u64 {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let working = (request.megapixels() * self.mb_per_megapixel as f64).ceil() as u64;
        if warm {
            working
        } else {
            working + self.model_footprint_mb
        }
    }
}

/// One diffusion run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffusionJob {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub seed: u64,
}

/// Whatever runs the model: loads weights, runs inference
#[async_trait]
pub trait DiffusionBackend: Send + Sync {
    async fn load_model(&self, model_id: &str) -> Result<(), HostError>;

    async fn unload_model(&self, model_id: &str) -> Result<(), HostError>;

    /// Run one job, returning encoded image bytes
    async fn generate(&self, job: &DiffusionJob) -> Result<Vec<u8>, HostError>;
}

/// Lets the resource manager drive a backend's lifecycle
struct BackendHost<'a>(&'a dyn DiffusionBackend);

#[async_trait]
impl ModelHost for BackendHost<'_> {
    async fn load(&self, model_id: &str) -> Result<(), HostError> {
        self.0.load_model(model_id).await
    }

    async fn unload(&self, model_id: &str) -> Result<(), HostError> {
        self.0.unload_model(model_id).await
    }
}

/// Diffusion model on the local GPU
pub struct LocalDiffusionProvider {
    config: LocalProviderConfig,
    manager: ResourceManager,
    backend: Arc<dyn DiffusionBackend>,
}

impl std::fmt::Debug for LocalDiffusionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDiffusionProvider")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl LocalDiffusionProvider {
    #[must_use]
    pub fn new(
        config: LocalProviderConfig,
        manager: ResourceManager,
        backend: Arc<dyn DiffusionBackend>,
    ) -> Self {
        Self {
            config,
            manager,
            backend,
        }
    }

    /// Resource manager this provider admits through
    #[inline]
    #[must_use]
    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }
}

fn host_failure(err: HostError) -> ProviderFailure {
    match err {
        HostError::OutOfMemory(m) => ProviderFailure::out_of_memory(ProviderKind::Local, m),
        HostError::Unavailable(m) => ProviderFailure::network(ProviderKind::Local, m),
        HostError::Failed(m) => ProviderFailure::unknown(ProviderKind::Local, m),
    }
}

#[async_trait]
impl ImageProvider for LocalDiffusionProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn admit(&self, request: &GenerationRequest) -> Result<ProviderLease, DenialReason> {
        if !self.config.enabled {
            return Err(DenialReason::NotConfigured("local provider disabled".into()));
        }
        let warm = self.manager.is_warm(&self.config.model_id);
        let estimated_mb = self.config.estimate_mb(request, warm);
        debug!(estimated_mb, warm, "requesting local slot");
        self.manager
            .request_local_slot(estimated_mb)
            .await
            .map(ProviderLease::Local)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        lease: ProviderLease,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let ProviderLease::Local(grant) = lease else {
            return Err(ProviderFailure::unknown(
                ProviderKind::Local,
                "local generation requires a granted slot",
            ));
        };

        let model = &self.config.model_id;
        let outcome = self
            .manager
            .load_model(&grant, model, &BackendHost(self.backend.as_ref()))
            .await
            .map_err(|e| match e {
                ResourceError::ModelLoad { source, .. } | ResourceError::ModelUnload { source, .. } => {
                    host_failure(source)
                }
                other => ProviderFailure::unknown(ProviderKind::Local, other.to_string()),
            })?;

        let seed = request.seed.unwrap_or_else(rand::random);
        let job = DiffusionJob {
            model: model.clone(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance: request.guidance_scale,
            seed,
        };

        let bytes = self.backend.generate(&job).await.map_err(|e| {
            warn!(error = %e, "local generation failed");
            host_failure(e)
        })?;
        drop(grant);

        let image = ImageArtifact::from_bytes(bytes)
            .map_err(|e| ProviderFailure::unknown(ProviderKind::Local, e.to_string()))?;
        info!(model = %model, seed, image = %image.hash().short(), "local image generated");

        let mut metadata = ProviderMetadata::new(model.clone())
            .with_extra("steps", request.steps)
            .with_extra("warm_start", outcome.was_warm());
        metadata.seed = Some(seed);
        Ok(ProviderOutput {
            provider: ProviderKind::Local,
            image,
            metadata,
        })
    }

    async fn shutdown(&self) {
        if let Err(e) = self
            .manager
            .shutdown(&BackendHost(self.backend.as_ref()))
            .await
        {
            warn!(error = %e, "local provider shutdown failed");
        }
    }
}

#[derive(Serialize)]
struct ModelRequest<'a> {
    model_id: &'a str,
}

#[derive(Deserialize)]
struct GenerationResponse {
    image: String,
}

/// HTTP client for a local GPU worker
///
/// ```text
/// POST /v1/models/load          {"model_id": ..}
/// POST /v1/models/unload        {"model_id": ..}
/// POST /v1/images/generations   DiffusionJob -> {"image": <base64 png>}
/// ```
#[derive(Debug, Clone)]
pub struct HttpDiffusionBackend {
    client: Client,
    base_url: String,
}

impl HttpDiffusionBackend {
    /// Create a client for the worker at `base_url`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, HostError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    HostError::Unavailable(e.to_string())
                } else {
                    HostError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_worker_error(status, &body))
    }
}

/// Map a worker error response to a host error
#[must_use]
pub fn classify_worker_error(status: StatusCode, body: &str) -> HostError {
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::INSUFFICIENT_STORAGE
        || lowered.contains("out of memory")
        || lowered.contains("outofmemory")
    {
        HostError::OutOfMemory(format!("{status}: {body}"))
    } else if status.is_server_error() && status != StatusCode::INTERNAL_SERVER_ERROR {
        HostError::Unavailable(format!("{status}: {body}"))
    } else {
        HostError::Failed(format!("{status}: {body}"))
    }
}

#[async_trait]
impl DiffusionBackend for HttpDiffusionBackend {
    async fn load_model(&self, model_id: &str) -> Result<(), HostError> {
        self.post("/v1/models/load", &ModelRequest { model_id }).await?;
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), HostError> {
        self.post("/v1/models/unload", &ModelRequest { model_id })
            .await?;
        Ok(())
    }

    async fn generate(&self, job: &DiffusionJob) -> Result<Vec<u8>, HostError> {
        let response: GenerationResponse = self
            .post("/v1/images/generations", job)
            .await?
            .json()
            .await
            .map_err(|e| HostError::Failed(format!("invalid worker response: {e}")))?;
        BASE64_STANDARD
            .decode(response.image.as_bytes())
            .map_err(|e| HostError::Failed(format!("invalid base64 image: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_skips_footprint_when_warm() {
        let config = LocalProviderConfig::default();
        let request = GenerationRequest::new("a large enough prompt").with_size(1000, 1000);
        assert_eq!(config.estimate_mb(&request, true), 2_500);
        assert_eq!(config.estimate_mb(&request, false), 14_500);
    }

    #[test]
    fn worker_errors_are_classified() {
        assert!(classify_worker_error(StatusCode::INSUFFICIENT_STORAGE, "").is_out_of_memory());
        assert!(classify_worker_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB"
        )
        .is_out_of_memory());
        assert!(matches!(
            classify_worker_error(StatusCode::SERVICE_UNAVAILABLE, "warming up"),
            HostError::Unavailable(_)
        ));
        assert!(matches!(
            classify_worker_error(StatusCode::BAD_REQUEST, "bad size"),
            HostError::Failed(_)
        ));
    }
}
