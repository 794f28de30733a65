//! Remote vendor image API provider
//!
//! Speaks the OpenAI-compatible images endpoint. Transient failures
//! (connection errors, 429, 5xx) are retried here with exponential backoff;
//! that loop is independent of the orchestrator's quality retries.

use std::time::Duration;

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use pictor_artifact::{GenerationRequest, ImageArtifact, ProviderKind};
use pictor_resource::DenialReason;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::provider::{
    FailureKind, ImageProvider, ProviderFailure, ProviderLease, ProviderMetadata, ProviderOutput,
};

/// Remote provider configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProviderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Inline key; prefer `api_key_env`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the key
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Network attempts per call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-image-1".to_string(),
            api_key: None,
            api_key_env: "PICTOR_REMOTE_API_KEY".to_string(),
            timeout_secs: 120,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl std::fmt::Debug for RemoteProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProviderConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RemoteProviderConfig {
    /// Config for `base_url` with an inline key
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// With network retry parameters
    #[must_use]
    pub fn with_backoff(mut self, max_attempts: u32, initial: Duration, max: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.initial_backoff_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
        self.max_backoff_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With job polling interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Inline key, falling back to the environment
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    #[inline]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before network attempt `attempt + 1` (1-based `attempt`)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Serialize)]
struct ImagesRequest<'a> {
    model: &'a str,
    prompt: String,
    n: u32,
    size: String,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Vec<ImageData>,
    #[serde(default)]
    error: Option<VendorError>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VendorError {
    #[serde(default)]
    message: String,
}

impl ImagesResponse {
    fn is_pending(&self) -> bool {
        self.data.is_empty()
            && matches!(
                self.status.as_deref(),
                Some("pending" | "queued" | "processing" | "in_progress" | "running")
            )
    }

    fn is_failed(&self) -> bool {
        self.error.is_some() || matches!(self.status.as_deref(), Some("failed" | "cancelled"))
    }
}

/// Vendor image API
#[derive(Debug)]
pub struct RemoteApiProvider {
    config: RemoteProviderConfig,
    client: Client,
    api_key: Option<String>,
}

impl RemoteApiProvider {
    /// Create a provider; the API key is resolved once here
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: RemoteProviderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        let api_key = config.resolve_api_key();
        Ok(Self {
            config,
            client,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Send with bounded retry on transient failures
    async fn send_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> Result<(Response, u32), ProviderFailure> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (failure, retry_after) = match build().send().await {
                Ok(response) if response.status().is_success() => return Ok((response, attempt)),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(&response);
                    let body = response.text().await.unwrap_or_default();
                    if !is_transient_status(status) {
                        return Err(ProviderFailure::unknown(
                            ProviderKind::Remote,
                            format!("{status}: {}", vendor_message(&body)),
                        ));
                    }
                    (
                        ProviderFailure::network(
                            ProviderKind::Remote,
                            format!("{status}: {}", vendor_message(&body)),
                        ),
                        retry_after,
                    )
                }
                Err(e) if e.is_timeout() => (
                    ProviderFailure::new(FailureKind::Timeout, ProviderKind::Remote, e.to_string()),
                    None,
                ),
                Err(e) => (ProviderFailure::network(ProviderKind::Remote, e.to_string()), None),
            };

            if attempt >= max_attempts {
                warn!(attempt, error = %failure, "remote request failed, giving up");
                return Err(failure);
            }
            let cap = Duration::from_millis(self.config.max_backoff_ms);
            let delay = retry_after.map_or_else(|| self.config.backoff(attempt), |d| d.min(cap));
            debug!(attempt, ?delay, error = %failure, "remote request failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    async fn poll(&self, job_id: &str, deadline: Instant) -> Result<ImagesResponse, ProviderFailure> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let url = self.url(&format!("/v1/images/generations/{job_id}"));
        loop {
            if Instant::now() + interval > deadline {
                return Err(ProviderFailure::timeout(
                    ProviderKind::Remote,
                    self.config.timeout(),
                ));
            }
            tokio::time::sleep(interval).await;
            let (response, _) = self
                .send_with_retry(|| self.authorized(self.client.get(&url)))
                .await?;
            let body = decode_body(response).await?;
            if body.is_failed() {
                return Err(vendor_failure(&body));
            }
            if !body.is_pending() {
                return Ok(body);
            }
            debug!(job_id, status = ?body.status, "remote job pending");
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn vendor_message(body: &str) -> String {
    serde_json::from_str::<ImagesResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .map_or_else(|| body.chars().take(200).collect(), |e| e.message)
}

fn vendor_failure(body: &ImagesResponse) -> ProviderFailure {
    let message = body
        .error
        .as_ref()
        .map_or_else(|| format!("job {:?}", body.status), |e| e.message.clone());
    ProviderFailure::unknown(ProviderKind::Remote, message)
}

async fn decode_body(response: Response) -> Result<ImagesResponse, ProviderFailure> {
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut body: ImagesResponse = response.json().await.map_err(|e| {
        ProviderFailure::unknown(ProviderKind::Remote, format!("invalid response: {e}"))
    })?;
    if body.id.is_none() {
        body.id = request_id;
    }
    Ok(body)
}

/// Prompt text sent to the vendor; the negative prompt is folded in
#[must_use]
pub fn vendor_prompt(request: &GenerationRequest) -> String {
    match request
        .negative_prompt
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
    {
        Some(negative) => format!("{}\n\nAvoid: {negative}", request.prompt.trim()),
        None => request.prompt.trim().to_string(),
    }
}

#[async_trait]
impl ImageProvider for RemoteApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn admit(&self, _request: &GenerationRequest) -> Result<ProviderLease, DenialReason> {
        if !self.config.enabled {
            return Err(DenialReason::NotConfigured("remote provider disabled".into()));
        }
        if self.api_key.is_none() {
            return Err(DenialReason::NotConfigured(format!(
                "no api key (set {})",
                self.config.api_key_env
            )));
        }
        Ok(ProviderLease::Unmetered)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _lease: ProviderLease,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let deadline = Instant::now() + self.config.timeout();
        let payload = ImagesRequest {
            model: &self.config.model,
            prompt: vendor_prompt(request),
            n: 1,
            size: format!("{}x{}", request.width, request.height),
            response_format: "b64_json",
            seed: request.seed,
        };
        let url = self.url("/v1/images/generations");

        let (response, network_attempts) = self
            .send_with_retry(|| self.authorized(self.client.post(&url).json(&payload)))
            .await?;
        let mut body = decode_body(response).await?;
        if body.is_failed() {
            return Err(vendor_failure(&body));
        }
        if body.is_pending() {
            let job_id = body.id.clone().ok_or_else(|| {
                ProviderFailure::unknown(ProviderKind::Remote, "pending job without id")
            })?;
            body = self.poll(&job_id, deadline).await?;
        }

        let first = body.data.into_iter().next().ok_or_else(|| {
            ProviderFailure::unknown(ProviderKind::Remote, "response contained no image")
        })?;
        let encoded = first.b64_json.ok_or_else(|| {
            ProviderFailure::unknown(ProviderKind::Remote, "response image has no b64_json")
        })?;
        let bytes = BASE64_STANDARD.decode(encoded.as_bytes()).map_err(|e| {
            ProviderFailure::unknown(ProviderKind::Remote, format!("invalid base64: {e}"))
        })?;
        let image = ImageArtifact::from_bytes(bytes)
            .map_err(|e| ProviderFailure::unknown(ProviderKind::Remote, e.to_string()))?;

        info!(
            model = %self.config.model,
            request_id = ?body.id,
            network_attempts,
            image = %image.hash().short(),
            "remote image generated"
        );
        let mut metadata = ProviderMetadata::new(self.config.model.clone())
            .with_extra("network_attempts", network_attempts);
        metadata.request_id = body.id;
        metadata.revised_prompt = first.revised_prompt;
        metadata.seed = request.seed;
        Ok(ProviderOutput {
            provider: ProviderKind::Remote,
            image,
            metadata,
        })
    }
}
