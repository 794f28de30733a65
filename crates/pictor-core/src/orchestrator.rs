//! Generation Orchestrator
//!
//! Drives one request through
//!
//! ```text
//! CACHE_LOOKUP --hit--> DONE
//!      |
//!     miss
//!      v
//!    ADMIT --> GENERATE --> CRITIQUE --VALID--> STORE_AND_DONE
//!      ^                       |
//!      +------ REGENERATE -----+--(retries exhausted)--> MAX_RETRIES_EXCEEDED
//! ```
//!
//! Attempts within one request are strictly sequential: attempt N+1 uses
//! a negative prompt derived from attempt N's critique. Across requests
//! nothing is ordered; local runs serialize through the resource manager's
//! admission gate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pictor_artifact::{Fingerprint, GenerationRequest, ProviderKind};
use pictor_cache::{CachedImage, GenerationCache};
use pictor_critic::{CritiqueResult, HttpScoringBackend, QualityCritic};
use pictor_providers::{
    HttpDiffusionBackend, ImageProvider, LocalDiffusionProvider, ProviderFailure, ProviderOutput,
    RemoteApiProvider,
};
use pictor_resource::{NvidiaSmiProbe, ResourceManager};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::config::PictorConfig;
use crate::error::{PictorError, ProviderDenial};
use crate::prompt::{apply_style, mutate_for_retry};
use crate::sink::{GenerationRecord, ResultSink};
use crate::types::{CachedGeneration, GenerationAttempt, GenerationResult, GenerationStatus};

/// A generated image together with its verdict
#[derive(Debug, Clone)]
struct Candidate {
    output: ProviderOutput,
    critique: CritiqueResult,
    request: GenerationRequest,
    retry_count: u32,
}

/// How one quality attempt ended at the provider level
enum AttemptOutcome {
    Produced(ProviderOutput),
    /// Nobody admitted the request
    AllDenied(Vec<ProviderDenial>),
    /// At least one provider ran and every one failed
    AllFailed(Vec<ProviderFailure>),
}

/// Per-request bookkeeping
struct Run {
    fingerprint: Fingerprint,
    started: Instant,
    attempts: Vec<GenerationAttempt>,
    local_blacklisted: bool,
    last_critique: Option<CritiqueResult>,
}

impl Run {
    fn result(
        &mut self,
        status: GenerationStatus,
        request: &GenerationRequest,
        candidate: Option<Candidate>,
        retry_count: u32,
        message: String,
    ) -> GenerationResult {
        let problems = self
            .last_critique
            .as_ref()
            .map(|c| c.problems.clone())
            .unwrap_or_default();
        let (image, provider, provider_metadata, critique, prompt_request) = match candidate {
            Some(c) => (
                Some(c.output.image),
                Some(c.output.provider),
                Some(c.output.metadata),
                Some(c.critique),
                c.request,
            ),
            None => (None, None, None, self.last_critique.clone(), request.clone()),
        };
        GenerationResult {
            id: Ulid::new(),
            success: status.is_success(),
            final_status: status,
            image_hash: image.as_ref().map(|i| *i.hash()),
            image,
            image_path: None,
            prompt_used: prompt_request.prompt,
            negative_prompt_used: prompt_request.negative_prompt,
            critique,
            retry_count,
            generation_time: self.started.elapsed(),
            message,
            problems,
            provider,
            provider_metadata,
            attempts: std::mem::take(&mut self.attempts),
            fingerprint: self.fingerprint,
            from_cache: false,
        }
    }
}

/// Top-level coordinator
pub struct Orchestrator {
    config: PictorConfig,
    providers: Vec<Arc<dyn ImageProvider>>,
    critic: QualityCritic,
    cache: Arc<GenerationCache>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.kind()).collect::<Vec<_>>(),
            )
            .field("critic", &self.critic)
            .field("cache_enabled", &self.cache.is_enabled())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble an orchestrator from ready-made parts
    ///
    /// # Errors
    /// [`PictorError::Configuration`] if `config` is invalid
    pub fn new(
        config: PictorConfig,
        providers: Vec<Arc<dyn ImageProvider>>,
        critic: QualityCritic,
        cache: Arc<GenerationCache>,
    ) -> Result<Self, PictorError> {
        config.validate()?;
        Ok(Self {
            config,
            providers,
            critic,
            cache,
            sink: None,
        })
    }

    /// Wire the production components described by `config`: an
    /// `nvidia-smi` probe, the HTTP GPU worker, the vendor API, the HTTP
    /// scoring service and the on-disk cache
    ///
    /// # Errors
    /// [`PictorError::Configuration`] if a client cannot be built,
    /// [`PictorError::Cache`] if the cache directory is unusable
    pub async fn from_config(config: PictorConfig) -> Result<Self, PictorError> {
        config.validate()?;
        let manager = ResourceManager::new(
            config.resource.clone(),
            Arc::new(NvidiaSmiProbe::new(config.resource.gpu_index)),
        );
        let worker = HttpDiffusionBackend::new(config.local.endpoint.clone(), config.local.timeout())
            .map_err(|e| client_error("gpu worker", e))?;
        let local: Arc<dyn ImageProvider> = Arc::new(LocalDiffusionProvider::new(
            config.local.clone(),
            manager,
            Arc::new(worker),
        ));
        let remote: Arc<dyn ImageProvider> = Arc::new(
            RemoteApiProvider::new(config.remote.clone()).map_err(|e| client_error("vendor", e))?,
        );

        let scorer = HttpScoringBackend::new(config.critic.endpoint.clone(), config.critic.timeout())
            .map_err(|e| client_error("critic", e))?;
        let critic = QualityCritic::new(config.critic.threshold, Arc::new(scorer));
        let cache = GenerationCache::open(config.cache.clone()).await?;

        Self::new(config, vec![local, remote], critic, Arc::new(cache))
    }

    /// With a persistence hook
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PictorConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn cache(&self) -> &GenerationCache {
        &self.cache
    }

    /// Release provider resources (unloads a warm local model)
    pub async fn shutdown(&self) {
        for provider in &self.providers {
            provider.shutdown().await;
        }
    }

    /// [`generate`](Self::generate) bounded by `deadline`
    ///
    /// A slot held when the deadline fires is released as the in-flight
    /// future is dropped.
    ///
    /// # Errors
    /// [`PictorError::DeadlineExceeded`] plus everything `generate` returns
    pub async fn generate_with_deadline(
        &self,
        request: GenerationRequest,
        deadline: Duration,
    ) -> Result<GenerationResult, PictorError> {
        tokio::time::timeout(deadline, self.generate(request))
            .await
            .map_err(|_| PictorError::DeadlineExceeded(deadline))?
    }

    /// Produce an accepted image for `request`
    ///
    /// Terminal provider and quality outcomes (`FAILED`,
    /// `MAX_RETRIES_EXCEEDED`, `UNEVALUATED`) are results, not errors. Once
    /// an attempt has been scored, later denials or critic outages end the
    /// call as `FAILED` carrying the best scored image. Every outcome past
    /// validation, error or not, is reported to the sink.
    ///
    /// # Errors
    /// - [`PictorError::Configuration`]: invalid request or unknown style,
    ///   before anything is touched
    /// - [`PictorError::ResourceExhausted`]: every provider denied admission
    ///   before any image was scored
    /// - [`PictorError::CritiqueFailure`]: the critic could not score the
    ///   first image and `accept_unevaluated` is off
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, PictorError> {
        let started = Instant::now();
        request.validate()?;
        let styled = self.styled(&request)?;
        let fingerprint = Fingerprint::of(&request)?;

        let span = info_span!("generate", fingerprint = %fingerprint.short());
        let outcome = self
            .run(styled.clone(), fingerprint, started)
            .instrument(span)
            .await;
        let record = match &outcome {
            Ok(result) => GenerationRecord::from(result),
            Err(e) => GenerationRecord::rejected(fingerprint, &styled, e, started.elapsed()),
        };
        self.emit(&record).await;
        outcome
    }

    fn styled(&self, request: &GenerationRequest) -> Result<GenerationRequest, PictorError> {
        match request.style.as_deref() {
            None => Ok(request.clone()),
            Some(name) => self
                .config
                .style(name)
                .map(|preset| apply_style(request, preset))
                .ok_or_else(|| PictorError::configuration(format!("unknown style preset {name:?}"))),
        }
    }

    fn providers_for(&self, request: &GenerationRequest) -> Vec<Arc<dyn ImageProvider>> {
        request
            .provider_preference
            .resolve(&self.config.provider_order)
            .into_iter()
            .filter_map(|kind| self.providers.iter().find(|p| p.kind() == kind).cloned())
            .collect()
    }

    async fn run(
        &self,
        request: GenerationRequest,
        fingerprint: Fingerprint,
        started: Instant,
    ) -> Result<GenerationResult, PictorError> {
        if let Some(hit) = self.cache.lookup(&fingerprint).await {
            info!("cache hit");
            return Ok(cached_result(hit, &request, fingerprint, started));
        }

        let providers = self.providers_for(&request);
        let max_retries = request.max_retries;
        let mut run = Run {
            fingerprint,
            started,
            attempts: Vec::new(),
            local_blacklisted: false,
            last_critique: None,
        };
        let mut best: Option<Candidate> = None;
        let mut current = request;

        for retry in 0..=max_retries {
            let number = retry.saturating_add(1);
            let output = match self.attempt(number, &current, &providers, &mut run).await {
                AttemptOutcome::Produced(output) => output,
                AttemptOutcome::AllDenied(denials) => {
                    warn!(attempt = number, denials = denials.len(), "no provider admitted the request");
                    let Some(best) = best else {
                        return Err(PictorError::ResourceExhausted { denials });
                    };
                    let message = format!(
                        "no provider admitted attempt {number} ({}); returning best earlier attempt",
                        join(&denials)
                    );
                    return Ok(run.result(GenerationStatus::Failed, &current, Some(best), retry, message));
                }
                AttemptOutcome::AllFailed(failures) => {
                    let summary = join(&failures);
                    error!(attempt = number, %summary, "every provider failed");
                    return Ok(run.result(
                        GenerationStatus::Failed,
                        &current,
                        best,
                        retry,
                        format!("all providers failed: {summary}"),
                    ));
                }
            };

            let critique = match self.critic.evaluate(&output.image, &current.prompt).await {
                Ok(critique) => critique,
                Err(e) if self.config.accept_unevaluated => {
                    warn!(error = %e, "returning unevaluated image");
                    let message = format!("image could not be evaluated: {e}");
                    let mut result =
                        run.result(GenerationStatus::Unevaluated, &current, None, retry, message);
                    result.image_hash = Some(*output.image.hash());
                    result.image = Some(output.image);
                    result.provider = Some(output.provider);
                    result.provider_metadata = Some(output.metadata);
                    result.critique = None;
                    return Ok(result);
                }
                Err(e) => {
                    error!(error = %e, "critique failed");
                    let Some(best) = best else {
                        return Err(e.into());
                    };
                    let message =
                        format!("critic unavailable on attempt {number} ({e}); returning best earlier attempt");
                    return Ok(run.result(GenerationStatus::Failed, &current, Some(best), retry, message));
                }
            };

            if let Some(last) = run.attempts.last_mut() {
                last.score_total = Some(critique.score_total);
            }
            info!(
                attempt = number,
                provider = %output.provider,
                score_total = critique.score_total,
                verdict = %critique.verdict,
                "attempt critiqued"
            );
            run.last_critique = Some(critique.clone());

            let candidate = Candidate {
                output,
                critique,
                request: current.clone(),
                retry_count: retry,
            };
            if candidate.critique.is_valid() {
                return Ok(self.accept(&mut run, candidate).await);
            }

            current = mutate_for_retry(&current, &candidate.critique);
            // ties keep the earliest attempt
            if best
                .as_ref()
                .map_or(true, |b| candidate.critique.score_total > b.critique.score_total)
            {
                best = Some(candidate);
            }
        }

        let best_total = best.as_ref().map_or(0, |b| b.critique.score_total);
        let message = format!(
            "no attempt reached {}/50 after {} attempts; best score {best_total}",
            self.critic.threshold(),
            u64::from(max_retries) + 1
        );
        warn!(best_total, "retries exhausted");
        Ok(run.result(
            GenerationStatus::MaxRetriesExceeded,
            &current,
            best,
            max_retries,
            message,
        ))
    }

    /// Try every provider in order until one produces an image
    async fn attempt(
        &self,
        number: u32,
        request: &GenerationRequest,
        providers: &[Arc<dyn ImageProvider>],
        run: &mut Run,
    ) -> AttemptOutcome {
        let mut denials = Vec::new();
        let mut failures = Vec::new();

        for provider in providers {
            let kind = provider.kind();
            if kind == ProviderKind::Local && run.local_blacklisted {
                debug!("local provider blacklisted for this request");
                continue;
            }

            let lease = match provider.admit(request).await {
                Ok(lease) => lease,
                Err(reason) => {
                    info!(provider = %kind, %reason, "admission denied");
                    denials.push(ProviderDenial {
                        provider: kind,
                        reason,
                    });
                    continue;
                }
            };

            let started_at = Utc::now();
            let clock = Instant::now();
            let budget = provider.timeout();
            let outcome = tokio::time::timeout(budget, provider.generate(request, lease))
                .await
                .unwrap_or_else(|_| Err(ProviderFailure::timeout(kind, budget)));

            let mut record = GenerationAttempt {
                attempt_number: number,
                provider_used: kind,
                started_at,
                duration: clock.elapsed(),
                raw_output_ref: None,
                succeeded: false,
                failure: None,
                score_total: None,
            };
            match outcome {
                Ok(output) => {
                    record.raw_output_ref = Some(*output.image.hash());
                    record.succeeded = true;
                    run.attempts.push(record);
                    return AttemptOutcome::Produced(output);
                }
                Err(failure) => {
                    warn!(provider = %kind, kind = %failure.kind, error = %failure.message, "provider failed");
                    if kind == ProviderKind::Local && failure.is_out_of_memory() {
                        run.local_blacklisted = true;
                    }
                    record.failure = Some(failure.clone());
                    run.attempts.push(record);
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            AttemptOutcome::AllDenied(denials)
        } else {
            AttemptOutcome::AllFailed(failures)
        }
    }

    /// STORE_AND_DONE
    async fn accept(&self, run: &mut Run, candidate: Candidate) -> GenerationResult {
        let retry_count = candidate.retry_count;
        let total = candidate.critique.score_total;
        let cached = CachedGeneration {
            prompt_used: candidate.request.prompt.clone(),
            negative_prompt_used: candidate.request.negative_prompt.clone(),
            critique: Some(candidate.critique.clone()),
            provider: Some(candidate.output.provider),
            provider_metadata: Some(candidate.output.metadata.clone()),
            retry_count,
        };
        let image = candidate.output.image.clone();
        let request = candidate.request.clone();

        let mut result = run.result(
            GenerationStatus::Validated,
            &request,
            Some(candidate),
            retry_count,
            format!("accepted with score {total}/50 after {retry_count} retries"),
        );

        let metadata = serde_json::to_value(&cached).unwrap_or_else(|e| {
            warn!(error = %e, "cache metadata not serializable");
            serde_json::Value::Null
        });
        match self.cache.store(run.fingerprint, &image, metadata).await {
            Ok(outcome) => result.image_path = outcome.path().map(Path::to_path_buf),
            Err(e) => warn!(error = %e, "cache store failed"),
        }
        info!(score_total = total, retry_count, "image validated");
        result
    }

    async fn emit(&self, record: &GenerationRecord) {
        let Some(sink) = &self.sink else { return };
        if let Err(e) = sink.record(record).await {
            warn!(error = %e, "result sink failed");
        }
    }
}

fn join(items: &[impl std::fmt::Display]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn client_error(what: &str, err: impl std::fmt::Display) -> PictorError {
    PictorError::configuration(format!("cannot build {what} client: {err}"))
}

fn cached_result(
    hit: CachedImage,
    request: &GenerationRequest,
    fingerprint: Fingerprint,
    started: Instant,
) -> GenerationResult {
    let cached: CachedGeneration = serde_json::from_value(hit.entry.metadata.clone())
        .unwrap_or_else(|e| {
            warn!(error = %e, "cache metadata unreadable");
            CachedGeneration {
                prompt_used: request.prompt.clone(),
                negative_prompt_used: request.negative_prompt.clone(),
                ..CachedGeneration::default()
            }
        });
    let problems = cached
        .critique
        .as_ref()
        .map(|c| c.problems.clone())
        .unwrap_or_default();
    GenerationResult {
        id: Ulid::new(),
        success: true,
        final_status: GenerationStatus::Validated,
        image_hash: Some(*hit.image.hash()),
        image: Some(hit.image),
        image_path: Some(hit.path),
        prompt_used: cached.prompt_used,
        negative_prompt_used: cached.negative_prompt_used,
        critique: cached.critique,
        retry_count: 0,
        generation_time: started.elapsed(),
        message: "served from cache".to_string(),
        problems,
        provider: cached.provider,
        provider_metadata: cached.provider_metadata,
        attempts: Vec::new(),
        fingerprint,
        from_cache: true,
    }
}
