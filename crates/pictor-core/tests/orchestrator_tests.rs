use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pictor_artifact::{GenerationRequest, ProviderKind, ProviderPreference};
use pictor_cache::{CacheConfig, GenerationCache};
use pictor_critic::{CritiqueError, QualityCritic, RawScores};
use pictor_core::{
    GenerationRecord, GenerationStatus, JsonLinesSink, Orchestrator, PictorConfig, PictorError,
};
use pictor_providers::{
    DiffusionBackend, DiffusionJob, FailureKind, ImageProvider, LocalDiffusionProvider,
    LocalProviderConfig,
};
use pictor_resource::{DenialReason, HostError, ResourceConfig, ResourceManager};
use pictor_test_utils::{
    png_bytes, raw_with_total, test_request, ScriptedProvider, ScriptedScorer, StaticProbe, Step,
};
use pretty_assertions::assert_eq;

struct Harness {
    local: Arc<ScriptedProvider>,
    remote: Arc<ScriptedProvider>,
    scorer: Arc<ScriptedScorer>,
    orchestrator: Orchestrator,
}

fn harness_with(
    local: ScriptedProvider,
    remote: ScriptedProvider,
    scorer: ScriptedScorer,
    config: PictorConfig,
    cache: GenerationCache,
) -> Harness {
    let local = Arc::new(local);
    let remote = Arc::new(remote);
    let scorer = Arc::new(scorer);
    let critic = QualityCritic::new(config.critic.threshold, scorer.clone());
    let providers: Vec<Arc<dyn ImageProvider>> = vec![local.clone(), remote.clone()];
    let orchestrator = Orchestrator::new(config, providers, critic, Arc::new(cache)).unwrap();
    Harness {
        local,
        remote,
        scorer,
        orchestrator,
    }
}

fn harness(local: ScriptedProvider, remote: ScriptedProvider, scorer: ScriptedScorer) -> Harness {
    harness_with(
        local,
        remote,
        scorer,
        PictorConfig::default().with_cache(CacheConfig::disabled()),
        GenerationCache::disabled(),
    )
}

#[tokio::test]
async fn test_first_attempt_accepted() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::new(vec![Ok(RawScores::new(8.0, 8.0, 9.0, 9.0, 8.0))]),
    );
    let request = test_request()
        .with_steps(8)
        .with_size(1024, 1024)
        .with_style("corporate_flat");

    let result = h.orchestrator.generate(request).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Validated);
    assert!(result.success);
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.score_total(), Some(42));
    assert_eq!(result.provider, Some(ProviderKind::Local));
    assert!(result.prompt_used.ends_with("clean geometric shapes"));
    assert!(result.image.is_some());
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(h.local.generations(), 1);
    assert_eq!(h.remote.admissions(), 0);
}

#[tokio::test]
async fn test_unwanted_text_triggers_steered_retry() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::new(vec![
            Ok(raw_with_total(20).with_unwanted_text(true)),
            Ok(raw_with_total(38)),
        ]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Validated);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.score_total(), Some(38));

    let requests = h.local.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].negative_prompt, None);
    let steered = requests[1].negative_prompt.as_deref().unwrap();
    assert!(steered.contains("watermark"), "{steered}");
    assert_eq!(result.negative_prompt_used.as_deref(), Some(steered));
}

#[tokio::test]
async fn test_exhaustion_returns_best_attempt() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[30, 28, 32]),
    );

    let result = h
        .orchestrator
        .generate(test_request().with_max_retries(2))
        .await
        .unwrap();

    assert_eq!(result.final_status, GenerationStatus::MaxRetriesExceeded);
    assert!(!result.success);
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.score_total(), Some(32));
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(result.image_hash, result.attempts[2].raw_output_ref);
    assert_eq!(h.scorer.calls(), 3);
}

#[tokio::test]
async fn test_ties_keep_earliest_attempt() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[30, 30]),
    );

    let result = h
        .orchestrator
        .generate(test_request().with_max_retries(1))
        .await
        .unwrap();

    assert_eq!(result.final_status, GenerationStatus::MaxRetriesExceeded);
    assert_eq!(result.image_hash, result.attempts[0].raw_output_ref);
    assert_ne!(result.attempts[0].raw_output_ref, result.attempts[1].raw_output_ref);
}

#[tokio::test]
async fn test_zero_retries_means_one_attempt() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[10]),
    );

    let result = h
        .orchestrator
        .generate(test_request().with_max_retries(0))
        .await
        .unwrap();
    assert_eq!(result.final_status, GenerationStatus::MaxRetriesExceeded);
    assert_eq!(result.retry_count, 0);
    assert_eq!(h.local.generations(), 1);
}

/// Backend that must never be reached
struct UnreachableBackend;

#[async_trait]
impl DiffusionBackend for UnreachableBackend {
    async fn load_model(&self, _model_id: &str) -> Result<(), HostError> {
        panic!("local model must not be loaded")
    }

    async fn unload_model(&self, _model_id: &str) -> Result<(), HostError> {
        Ok(())
    }

    async fn generate(&self, _job: &DiffusionJob) -> Result<Vec<u8>, HostError> {
        panic!("local generation must not run")
    }
}

#[tokio::test]
async fn test_low_vram_falls_back_to_remote() {
    let manager = ResourceManager::new(
        ResourceConfig::default().with_safety_margin_mb(1_000),
        Arc::new(StaticProbe::free(500)),
    );
    let local = Arc::new(LocalDiffusionProvider::new(
        LocalProviderConfig::default(),
        manager,
        Arc::new(UnreachableBackend),
    ));
    let remote = Arc::new(ScriptedProvider::remote());
    let critic = QualityCritic::new(35, Arc::new(ScriptedScorer::totals(&[40])));
    let orchestrator = Orchestrator::new(
        PictorConfig::default().with_cache(CacheConfig::disabled()),
        vec![local.clone(), remote.clone()],
        critic,
        Arc::new(GenerationCache::disabled()),
    )
    .unwrap();

    let result = orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Validated);
    assert_eq!(result.provider, Some(ProviderKind::Remote));
    assert_eq!(remote.generations(), 1);
    assert_eq!(local.manager().in_use(), 0);
}

#[tokio::test]
async fn test_every_denial_is_resource_exhausted() {
    let h = harness(
        ScriptedProvider::local().denying(DenialReason::NoDevice),
        ScriptedProvider::remote().denying(DenialReason::NotConfigured("no api key".into())),
        ScriptedScorer::totals(&[40]),
    );

    let err = h.orchestrator.generate(test_request()).await.unwrap_err();
    match err {
        PictorError::ResourceExhausted { denials } => {
            assert_eq!(denials.len(), 2);
            assert_eq!(denials[0].provider, ProviderKind::Local);
            assert_eq!(denials[1].reason, DenialReason::NotConfigured("no api key".into()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.scorer.calls(), 0);
}

#[tokio::test]
async fn test_local_only_does_not_fall_back() {
    let h = harness(
        ScriptedProvider::local().denying(DenialReason::TransitionInFlight),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[40]),
    );

    let err = h
        .orchestrator
        .generate(test_request().with_provider_preference(ProviderPreference::LocalOnly))
        .await
        .unwrap_err();
    assert!(matches!(err, PictorError::ResourceExhausted { .. }));
    assert_eq!(h.remote.admissions(), 0);
}

#[tokio::test]
async fn test_remote_preference_goes_first() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[40]),
    );

    let result = h
        .orchestrator
        .generate(test_request().with_provider_preference(ProviderPreference::Remote))
        .await
        .unwrap();
    assert_eq!(result.provider, Some(ProviderKind::Remote));
    assert_eq!(h.local.admissions(), 0);
}

#[tokio::test]
async fn test_out_of_memory_blacklists_local() {
    let h = harness(
        ScriptedProvider::local().then_fail(FailureKind::OutOfMemory),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[20, 40]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Validated);
    assert_eq!(result.retry_count, 1);
    assert_eq!(h.local.admissions(), 1);
    assert_eq!(h.remote.generations(), 2);

    let providers: Vec<_> = result.attempts.iter().map(|a| a.provider_used).collect();
    assert_eq!(
        providers,
        vec![ProviderKind::Local, ProviderKind::Remote, ProviderKind::Remote]
    );
    let oom = result.attempts[0].failure.as_ref().unwrap();
    assert_eq!(oom.kind, FailureKind::OutOfMemory);
    assert_eq!(result.attempts[1].attempt_number, 1);
    assert_eq!(result.attempts[2].attempt_number, 2);
}

#[tokio::test]
async fn test_all_providers_failing_is_failed() {
    let h = harness(
        ScriptedProvider::local().then_fail(FailureKind::Network),
        ScriptedProvider::remote().then_fail(FailureKind::Unknown),
        ScriptedScorer::totals(&[40]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Failed);
    assert!(!result.success);
    assert!(result.image.is_none());
    assert_eq!(result.attempts.len(), 2);
    assert!(result.message.contains("all providers failed"));
    assert_eq!(h.scorer.calls(), 0);
}

#[tokio::test]
async fn test_failure_after_critique_reports_last_problems() {
    let h = harness(
        ScriptedProvider::local()
            .then(Step::Image)
            .then_fail(FailureKind::Network),
        ScriptedProvider::remote().denying(DenialReason::NotConfigured("no api key".into())),
        ScriptedScorer::new(vec![Ok(
            raw_with_total(20).with_problem("subject is off-center")
        )]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Failed);
    assert_eq!(result.retry_count, 1);
    assert!(result
        .problems
        .contains(&"subject is off-center".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_provider_timeout_falls_through() {
    let h = harness(
        ScriptedProvider::local()
            .with_timeout(Duration::from_millis(50))
            .then(Step::Slow(Duration::from_secs(10))),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[40]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Validated);
    assert_eq!(result.provider, Some(ProviderKind::Remote));
    let timeout = result.attempts[0].failure.as_ref().unwrap();
    assert_eq!(timeout.kind, FailureKind::Timeout);
}

#[tokio::test]
async fn test_unreachable_critic_is_distinct_failure() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::unreachable(),
    );

    let err = h.orchestrator.generate(test_request()).await.unwrap_err();
    assert!(matches!(
        err,
        PictorError::CritiqueFailure(CritiqueError::BackendUnreachable(_))
    ));
}

#[tokio::test]
async fn test_unevaluated_images_can_be_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig::new(dir.path(), 1 << 20);
    let cache = GenerationCache::open(cache_config.clone()).await.unwrap();
    let h = harness_with(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::unreachable(),
        PictorConfig::default()
            .with_cache(cache_config)
            .with_accept_unevaluated(true),
        cache,
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Unevaluated);
    assert!(!result.success);
    assert!(result.image.is_some());
    assert!(result.critique.is_none());
    assert_eq!(h.orchestrator.cache().stats().await.entries, 0);
}

#[tokio::test]
async fn test_invalid_request_touches_nothing() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[40]),
    );

    let short = GenerationRequest::new("tiny");
    assert!(matches!(
        h.orchestrator.generate(short).await,
        Err(PictorError::Configuration(_))
    ));

    let unknown_style = test_request().with_style("baroque");
    assert!(matches!(
        h.orchestrator.generate(unknown_style).await,
        Err(PictorError::Configuration(_))
    ));

    let endless = test_request().with_max_retries(u32::MAX);
    assert!(matches!(
        h.orchestrator.generate(endless).await,
        Err(PictorError::Configuration(_))
    ));

    let too_large = test_request().with_size(4096, 1024);
    assert!(matches!(
        h.orchestrator.generate(too_large).await,
        Err(PictorError::Configuration(_))
    ));

    assert_eq!(h.local.admissions(), 0);
    assert_eq!(h.remote.admissions(), 0);
}

#[tokio::test]
async fn test_second_identical_request_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig::new(dir.path(), 1 << 20);
    let cache = GenerationCache::open(cache_config.clone()).await.unwrap();
    let h = harness_with(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[42]),
        PictorConfig::default().with_cache(cache_config),
        cache,
    );
    let request = test_request().with_style("isometric");

    let first = h.orchestrator.generate(request.clone()).await.unwrap();
    assert_eq!(first.final_status, GenerationStatus::Validated);
    assert!(!first.from_cache);
    let path = first.image_path.clone().unwrap();
    assert!(path.exists());

    let second = h.orchestrator.generate(request).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.final_status, GenerationStatus::Validated);
    assert_eq!(second.image_hash, first.image_hash);
    assert_eq!(second.image_path, Some(path));
    assert_eq!(second.prompt_used, first.prompt_used);
    assert_eq!(second.score_total(), Some(42));
    assert!(second.generation_time_seconds() < 0.5);
    assert!(second.attempts.is_empty());

    assert_eq!(h.local.generations(), 1);
    assert_eq!(h.scorer.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_results_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig::new(dir.path(), 1 << 20);
    let cache = GenerationCache::open(cache_config.clone()).await.unwrap();
    let h = harness_with(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[10]),
        PictorConfig::default().with_cache(cache_config),
        cache,
    );

    let request = test_request().with_max_retries(0);
    h.orchestrator.generate(request.clone()).await.unwrap();
    let again = h.orchestrator.generate(request).await.unwrap();

    assert!(!again.from_cache);
    assert_eq!(h.local.generations(), 2);
}

/// Local backend that never finishes a generation
struct StuckBackend;

#[async_trait]
impl DiffusionBackend for StuckBackend {
    async fn load_model(&self, _model_id: &str) -> Result<(), HostError> {
        Ok(())
    }

    async fn unload_model(&self, _model_id: &str) -> Result<(), HostError> {
        Ok(())
    }

    async fn generate(&self, _job: &DiffusionJob) -> Result<Vec<u8>, HostError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(png_bytes(8, 8))
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_releases_local_slot() {
    let manager = ResourceManager::new(ResourceConfig::default(), Arc::new(StaticProbe::free(24_000)));
    let local = Arc::new(LocalDiffusionProvider::new(
        LocalProviderConfig::default(),
        manager.clone(),
        Arc::new(StuckBackend),
    ));
    let critic = QualityCritic::new(35, Arc::new(ScriptedScorer::totals(&[40])));
    let orchestrator = Orchestrator::new(
        PictorConfig::default().with_cache(CacheConfig::disabled()),
        vec![local],
        critic,
        Arc::new(GenerationCache::disabled()),
    )
    .unwrap();

    let err = orchestrator
        .generate_with_deadline(
            test_request().with_provider_preference(ProviderPreference::LocalOnly),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PictorError::DeadlineExceeded(_)));
    assert!(err.is_retryable());
    assert_eq!(manager.in_use(), 0);
    assert!(manager.is_warm("flux.1-schnell"));
}

#[tokio::test]
async fn test_sink_receives_every_terminal_result() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("records").join("generations.jsonl");
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[42, 10]),
    );
    let orchestrator = h.orchestrator.with_sink(Arc::new(JsonLinesSink::new(&log)));

    orchestrator.generate(test_request()).await.unwrap();
    orchestrator
        .generate(test_request().with_max_retries(0))
        .await
        .unwrap();

    let text = std::fs::read_to_string(&log).unwrap();
    let records: Vec<GenerationRecord> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, GenerationStatus::Validated);
    assert_eq!(records[0].score_total, Some(42));
    assert_eq!(records[0].provider, Some(ProviderKind::Local));
    assert_eq!(records[1].status, GenerationStatus::MaxRetriesExceeded);
}

#[tokio::test]
async fn test_concurrent_identical_requests_both_generate() {
    let dir = tempfile::tempdir().unwrap();
    let cache_config = CacheConfig::new(dir.path(), 1 << 20);
    let cache = GenerationCache::open(cache_config.clone()).await.unwrap();
    let h = harness_with(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::totals(&[40]),
        PictorConfig::default().with_cache(cache_config),
        cache,
    );

    let (a, b) = tokio::join!(
        h.orchestrator.generate(test_request()),
        h.orchestrator.generate(test_request())
    );
    assert_eq!(a.unwrap().final_status, GenerationStatus::Validated);
    assert_eq!(b.unwrap().final_status, GenerationStatus::Validated);
    assert_eq!(h.orchestrator.cache().stats().await.entries, 1);
}

#[tokio::test]
async fn test_late_denial_keeps_best_attempt() {
    let h = harness(
        ScriptedProvider::local().denying_after(1, DenialReason::TransitionInFlight),
        ScriptedProvider::remote(),
        ScriptedScorer::new(vec![Ok(
            raw_with_total(30).with_problem("subject is cropped")
        )]),
    );

    let result = h
        .orchestrator
        .generate(
            test_request()
                .with_max_retries(2)
                .with_provider_preference(ProviderPreference::LocalOnly),
        )
        .await
        .unwrap();

    assert_eq!(result.final_status, GenerationStatus::Failed);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.score_total(), Some(30));
    assert!(result.image.is_some());
    assert_eq!(result.image_hash, result.attempts[0].raw_output_ref);
    assert!(result.problems.contains(&"subject is cropped".to_string()));
    assert!(result.message.contains("no provider admitted attempt 2"));
    assert_eq!(h.local.admissions(), 2);
    assert_eq!(h.remote.admissions(), 0);
}

#[tokio::test]
async fn test_critic_outage_after_scoring_keeps_best_attempt() {
    let h = harness(
        ScriptedProvider::local(),
        ScriptedProvider::remote(),
        ScriptedScorer::new(vec![
            Ok(raw_with_total(30)),
            Err(CritiqueError::BackendUnreachable("connection reset".into())),
        ]),
    );

    let result = h.orchestrator.generate(test_request()).await.unwrap();

    assert_eq!(result.final_status, GenerationStatus::Failed);
    assert_eq!(result.score_total(), Some(30));
    assert_eq!(result.image_hash, result.attempts[0].raw_output_ref);
    assert!(result.message.contains("critic unavailable"));
}

#[tokio::test]
async fn test_sink_records_error_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("generations.jsonl");
    let h = harness(
        ScriptedProvider::local().denying(DenialReason::NoDevice),
        ScriptedProvider::remote().denying(DenialReason::NotConfigured("no api key".into())),
        ScriptedScorer::totals(&[40]),
    );
    let orchestrator = h.orchestrator.with_sink(Arc::new(JsonLinesSink::new(&log)));

    let err = orchestrator.generate(test_request()).await.unwrap_err();
    assert!(matches!(err, PictorError::ResourceExhausted { .. }));

    let text = std::fs::read_to_string(&log).unwrap();
    let records: Vec<GenerationRecord> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, GenerationStatus::Failed);
    assert_eq!(records[0].error.as_deref(), Some(err.to_string().as_str()));
    assert_eq!(records[0].prompt_used, test_request().prompt);
}
