use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pictor_resource::{
    DenialReason, HostError, LifecyclePhase, LoadOutcome, ModelHost, ProbeError, ResourceConfig,
    ResourceError, ResourceManager, VramProbe, VramStatus,
};
use tokio::time::Instant;

struct FixedProbe(Mutex<Result<VramStatus, ProbeError>>);

impl FixedProbe {
    fn free(total_mb: u64, free_mb: u64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Ok(VramStatus::new(
            total_mb,
            total_mb - free_mb,
            free_mb,
        )))))
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Err(ProbeError::Parse("garbage".into())))))
    }
}

#[async_trait]
impl VramProbe for FixedProbe {
    async fn sample(&self) -> Result<VramStatus, ProbeError> {
        self.0.lock().clone()
    }
}

#[derive(Default)]
struct RecordingHost {
    events: Mutex<Vec<(String, Instant)>>,
    fail_load: Mutex<Option<HostError>>,
}

impl RecordingHost {
    fn events(&self) -> Vec<String> {
        self.events.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    fn at(&self, event: &str) -> Instant {
        self.events
            .lock()
            .iter()
            .find(|(e, _)| e == event)
            .map(|(_, t)| *t)
            .unwrap()
    }
}

#[async_trait]
impl ModelHost for RecordingHost {
    async fn load(&self, model_id: &str) -> Result<(), HostError> {
        if let Some(err) = self.fail_load.lock().take() {
            return Err(err);
        }
        self.events
            .lock()
            .push((format!("load:{model_id}"), Instant::now()));
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<(), HostError> {
        self.events
            .lock()
            .push((format!("unload:{model_id}"), Instant::now()));
        Ok(())
    }
}

fn config() -> ResourceConfig {
    ResourceConfig::default()
        .with_safety_margin_mb(1000)
        .with_transition_delay(Duration::from_secs(3))
        .with_admission_timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn test_insufficient_vram_is_denied() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 500));
    let denial = manager.request_local_slot(100).await.unwrap_err();
    assert_eq!(
        denial,
        DenialReason::InsufficientVram {
            available_mb: 0,
            estimated_mb: 100
        }
    );
    assert_eq!(manager.in_use(), 0);
}

#[tokio::test]
async fn test_margin_boundary_is_inclusive() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 7_000));
    assert!(manager.request_local_slot(6_000).await.is_ok());
}

#[tokio::test]
async fn test_probe_failure_denies() {
    let manager = ResourceManager::new(config(), FixedProbe::failing());
    assert!(matches!(
        manager.request_local_slot(1).await,
        Err(DenialReason::ProbeFailed(_))
    ));
}

#[tokio::test]
async fn test_cpu_only_host_denies() {
    let probe = Arc::new(FixedProbe(Mutex::new(Ok(VramStatus::cpu_only()))));
    let manager = ResourceManager::new(config(), probe);
    assert_eq!(
        manager.request_local_slot(1).await.unwrap_err(),
        DenialReason::NoDevice
    );
}

#[tokio::test(start_paused = true)]
async fn test_capacity_one_serializes() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));

    let grant = manager.request_local_slot(1_000).await.unwrap();
    assert_eq!(manager.in_use(), 1);
    assert_eq!(
        manager.request_local_slot(1_000).await.unwrap_err(),
        DenialReason::AdmissionTimeout
    );

    manager.release_slot(grant);
    assert_eq!(manager.in_use(), 0);
    assert!(manager.request_local_slot(1_000).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_is_admitted_after_release() {
    let manager = ResourceManager::new(
        config().with_admission_timeout(Duration::from_secs(10)),
        FixedProbe::free(24_000, 20_000),
    );
    let grant = manager.request_local_slot(1_000).await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.request_local_slot(1_000).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(grant);

    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_holder_releases_slot() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));

    let holder = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let _grant = manager.request_local_slot(1_000).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.in_use(), 1);

    holder.abort();
    let _ = holder.await;
    assert_eq!(manager.in_use(), 0);
    assert!(manager.request_local_slot(1_000).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_model_switch_waits_for_cooldown() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let host = RecordingHost::default();

    let grant = manager.request_local_slot(1_000).await.unwrap();
    let first = manager.load_model(&grant, "model-a", &host).await.unwrap();
    assert_eq!(
        first,
        LoadOutcome::Loaded {
            replaced: false,
            cooldown: Duration::ZERO
        }
    );
    assert!(manager.is_warm("model-a"));

    let second = manager.load_model(&grant, "model-b", &host).await.unwrap();
    assert!(matches!(second, LoadOutcome::Loaded { replaced: true, .. }));
    assert_eq!(
        host.events(),
        vec!["load:model-a", "unload:model-a", "load:model-b"]
    );
    assert!(host.at("load:model-b") - host.at("unload:model-a") >= Duration::from_secs(3));

    let lifecycle = manager.lifecycle();
    assert_eq!(lifecycle.phase, LifecyclePhase::Loaded);
    assert_eq!(lifecycle.current_model_id.as_deref(), Some("model-b"));
    assert!(lifecycle.last_transition_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_warm_model_is_not_reloaded() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let host = RecordingHost::default();

    let grant = manager.request_local_slot(1_000).await.unwrap();
    manager.load_model(&grant, "model-a", &host).await.unwrap();
    drop(grant);

    // released slot keeps the model warm
    let grant = manager.request_local_slot(1_000).await.unwrap();
    let outcome = manager.load_model(&grant, "model-a", &host).await.unwrap();
    assert!(outcome.was_warm());
    assert_eq!(host.events(), vec!["load:model-a"]);
}

#[tokio::test]
async fn test_failed_load_leaves_unloaded() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let host = RecordingHost::default();
    *host.fail_load.lock() = Some(HostError::OutOfMemory("CUDA out of memory".into()));

    let grant = manager.request_local_slot(1_000).await.unwrap();
    let err = manager.load_model(&grant, "model-a", &host).await.unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(matches!(err, ResourceError::ModelLoad { .. }));

    let lifecycle = manager.lifecycle();
    assert_eq!(lifecycle.phase, LifecyclePhase::Unloaded);
    assert_eq!(lifecycle.current_model_id, None);
}

#[tokio::test]
async fn test_foreign_grant_is_rejected() {
    let a = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let b = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let host = RecordingHost::default();

    let grant = a.request_local_slot(1_000).await.unwrap();
    assert_eq!(
        b.load_model(&grant, "model-a", &host).await.unwrap_err(),
        ResourceError::ForeignGrant
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_unloads_and_closes() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let host = RecordingHost::default();

    let grant = manager.request_local_slot(1_000).await.unwrap();
    manager.load_model(&grant, "model-a", &host).await.unwrap();
    drop(grant);

    manager.shutdown(&host).await.unwrap();
    assert_eq!(host.events(), vec!["load:model-a", "unload:model-a"]);
    assert_eq!(manager.lifecycle().phase, LifecyclePhase::Unloaded);
    assert_eq!(
        manager.request_local_slot(1).await.unwrap_err(),
        DenialReason::ShutDown
    );
}

#[tokio::test]
async fn test_device_status_applies_margin() {
    let manager = ResourceManager::new(config(), FixedProbe::free(24_000, 20_000));
    let status = manager.device_status().await.unwrap();
    assert_eq!(status.safety_margin_mb, 1000);
    assert_eq!(status.available_mb(), 19_000);
}
