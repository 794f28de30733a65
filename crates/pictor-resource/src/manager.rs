//! Resource manager
//!
//! Sole authority over the local device. Local generations are admitted
//! through a counting semaphore of `capacity` slots (1 by default); each
//! admission re-samples VRAM and checks it against the safety margin.
//! Model loads and unloads are serialized behind a transition lock and
//! respect a cooldown since the previous transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DenialReason, ProbeError, ResourceError};
use crate::lifecycle::{validate_transition, LifecyclePhase, ModelHost, ModelLifecycleState};
use crate::vram::{VramProbe, VramStatus};

/// Resource manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Concurrent local generations (1 per GPU)
    pub capacity: usize,
    /// Memory kept free on top of every estimate
    pub safety_margin_mb: u64,
    /// Minimum time between a lifecycle transition and the next load
    pub transition_delay_ms: u64,
    /// How long a request may wait for a local slot
    pub admission_timeout_ms: u64,
    /// GPU index passed to the probe
    pub gpu_index: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            safety_margin_mb: 1024,
            transition_delay_ms: 2_000,
            admission_timeout_ms: 60_000,
            gpu_index: 0,
        }
    }
}

impl ResourceConfig {
    /// With slot count
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// With safety margin
    #[inline]
    #[must_use]
    pub fn with_safety_margin_mb(mut self, margin: u64) -> Self {
        self.safety_margin_mb = margin;
        self
    }

    /// With transition cooldown
    #[inline]
    #[must_use]
    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay_ms = duration_ms(delay);
        self
    }

    /// With admission wait bound
    #[inline]
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout_ms = duration_ms(timeout);
        self
    }

    /// Transition cooldown
    #[inline]
    #[must_use]
    pub const fn transition_delay(&self) -> Duration {
        Duration::from_millis(self.transition_delay_ms)
    }

    /// Admission wait bound
    #[inline]
    #[must_use]
    pub const fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// How a [`ResourceManager::load_model`] call was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Requested model was already loaded
    Warm,
    /// Model was loaded, after unloading `replaced` if any
    Loaded { replaced: bool, cooldown: Duration },
}

impl LoadOutcome {
    /// Whether no load was needed
    #[inline]
    #[must_use]
    pub const fn was_warm(&self) -> bool {
        matches!(self, LoadOutcome::Warm)
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    in_use: usize,
    lifecycle: ModelLifecycleState,
    last_transition: Option<Instant>,
    transition_in_flight: bool,
}

impl DeviceState {
    fn transition(&mut self, to: LifecyclePhase) -> Result<(), ResourceError> {
        validate_transition(self.lifecycle.phase, to)?;
        debug!(from = ?self.lifecycle.phase, to = ?to, "lifecycle transition");
        self.lifecycle.phase = to;
        self.lifecycle.last_transition_at = Some(Utc::now());
        self.last_transition = Some(Instant::now());
        Ok(())
    }
}

struct Inner {
    config: ResourceConfig,
    probe: Arc<dyn VramProbe>,
    slots: Arc<Semaphore>,
    state: Mutex<DeviceState>,
    transition: tokio::sync::Mutex<()>,
}

/// Capacity-limited admission controller and model lifecycle sequencer
///
/// Cheap to clone; clones share the same device state.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourceManager")
            .field("config", &self.inner.config)
            .field("in_use", &state.in_use)
            .field("lifecycle", &state.lifecycle)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Create a manager over `probe`
    #[must_use]
    pub fn new(config: ResourceConfig, probe: Arc<dyn VramProbe>) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(capacity)),
                probe,
                state: Mutex::new(DeviceState::default()),
                transition: tokio::sync::Mutex::new(()),
                config,
            }),
        }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Request one local slot for an allocation of `estimated_mb`.
    ///
    /// Waits at most `admission_timeout` for a free slot, then samples VRAM.
    /// A failed sample is treated as a full device.
    ///
    /// # Errors
    /// Returns the [`DenialReason`] when admission is refused
    pub async fn request_local_slot(&self, estimated_mb: u64) -> Result<SlotGrant, DenialReason> {
        let timeout = self.inner.config.admission_timeout();
        let permit = match tokio::time::timeout(timeout, self.inner.slots.clone().acquire_owned())
            .await
        {
            Err(_) => {
                debug!(?timeout, "local admission timed out");
                return Err(DenialReason::AdmissionTimeout);
            }
            Ok(Err(_closed)) => return Err(DenialReason::ShutDown),
            Ok(Ok(permit)) => permit,
        };

        let in_flight = self.inner.state.lock().transition_in_flight;
        if in_flight {
            return Err(DenialReason::TransitionInFlight);
        }

        let status = match self.device_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "vram sampling failed, denying local admission");
                return Err(DenialReason::ProbeFailed(e.to_string()));
            }
        };
        if !status.has_device() {
            return Err(DenialReason::NoDevice);
        }
        if !status.fits(estimated_mb) {
            debug!(
                free_mb = status.free_mb,
                margin_mb = status.safety_margin_mb,
                estimated_mb,
                "local admission denied"
            );
            return Err(DenialReason::InsufficientVram {
                available_mb: status.available_mb(),
                estimated_mb,
            });
        }

        let in_use = {
            let mut state = self.inner.state.lock();
            state.in_use += 1;
            state.in_use
        };
        info!(estimated_mb, in_use, "local slot granted");
        Ok(SlotGrant {
            estimated_mb,
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Give a slot back. Equivalent to dropping the grant; the loaded
    /// model stays warm.
    pub fn release_slot(&self, grant: SlotGrant) {
        drop(grant);
    }

    /// Make `model_id` the loaded model.
    ///
    /// If another model is loaded it is unloaded first. The load itself
    /// starts no earlier than `transition_delay` after the previous
    /// lifecycle transition.
    ///
    /// # Errors
    /// Returns error if the grant is foreign, or the host fails to unload
    /// the previous model or load the new one
    pub async fn load_model(
        &self,
        grant: &SlotGrant,
        model_id: &str,
        host: &dyn ModelHost,
    ) -> Result<LoadOutcome, ResourceError> {
        if !Arc::ptr_eq(&grant.inner, &self.inner) {
            return Err(ResourceError::ForeignGrant);
        }
        let _serialized = self.inner.transition.lock().await;

        let previous = {
            let state = self.inner.state.lock();
            if state.lifecycle.is_warm(model_id) {
                debug!(model_id, "model already warm");
                return Ok(LoadOutcome::Warm);
            }
            (state.lifecycle.phase == LifecyclePhase::Loaded)
                .then(|| state.lifecycle.current_model_id.clone())
                .flatten()
        };

        let _in_flight = InFlight::begin(&self.inner.state);

        let replaced = match previous {
            Some(old) => {
                self.unload_locked(&old, host).await?;
                true
            }
            None => false,
        };

        let cooldown = self.wait_cooldown().await;

        self.inner.state.lock().transition(LifecyclePhase::Loading)?;
        info!(model_id, "loading model");
        if let Err(source) = host.load(model_id).await {
            let mut state = self.inner.state.lock();
            state.transition(LifecyclePhase::Unloaded)?;
            state.lifecycle.current_model_id = None;
            warn!(model_id, error = %source, "model load failed");
            return Err(ResourceError::ModelLoad {
                model_id: model_id.to_string(),
                source,
            });
        }
        {
            let mut state = self.inner.state.lock();
            state.transition(LifecyclePhase::Loaded)?;
            state.lifecycle.current_model_id = Some(model_id.to_string());
        }
        info!(model_id, replaced, ?cooldown, "model loaded");
        Ok(LoadOutcome::Loaded { replaced, cooldown })
    }

    /// Unload any warm model and refuse further admissions.
    ///
    /// Waits for every outstanding grant to be released first.
    ///
    /// # Errors
    /// Returns error if already shut down or the host fails to unload
    pub async fn shutdown(&self, host: &dyn ModelHost) -> Result<(), ResourceError> {
        let capacity = u32::try_from(self.inner.config.capacity.max(1)).unwrap_or(u32::MAX);
        let _all = self
            .inner
            .slots
            .acquire_many(capacity)
            .await
            .map_err(|_| ResourceError::ShutDown)?;
        self.inner.slots.close();

        let _serialized = self.inner.transition.lock().await;
        let loaded = {
            let state = self.inner.state.lock();
            (state.lifecycle.phase == LifecyclePhase::Loaded)
                .then(|| state.lifecycle.current_model_id.clone())
                .flatten()
        };
        if let Some(model_id) = loaded {
            let _in_flight = InFlight::begin(&self.inner.state);
            self.unload_locked(&model_id, host).await?;
        }
        info!("resource manager shut down");
        Ok(())
    }

    /// Current VRAM sample with the safety margin applied
    ///
    /// # Errors
    /// Returns error if the probe fails
    pub async fn device_status(&self) -> Result<VramStatus, ProbeError> {
        let status = self.inner.probe.sample().await?;
        Ok(status.with_safety_margin(self.inner.config.safety_margin_mb))
    }

    /// Lifecycle snapshot
    #[must_use]
    pub fn lifecycle(&self) -> ModelLifecycleState {
        self.inner.state.lock().lifecycle.clone()
    }

    /// Whether `model_id` is loaded and ready
    #[must_use]
    pub fn is_warm(&self, model_id: &str) -> bool {
        self.inner.state.lock().lifecycle.is_warm(model_id)
    }

    /// Slots currently granted
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Caller must hold the transition lock.
    async fn unload_locked(&self, model_id: &str, host: &dyn ModelHost) -> Result<(), ResourceError> {
        self.inner.state.lock().transition(LifecyclePhase::Unloading)?;
        info!(model_id, "unloading model");
        if let Err(source) = host.unload(model_id).await {
            self.inner.state.lock().transition(LifecyclePhase::Loaded)?;
            warn!(model_id, error = %source, "model unload failed");
            return Err(ResourceError::ModelUnload {
                model_id: model_id.to_string(),
                source,
            });
        }
        let mut state = self.inner.state.lock();
        state.transition(LifecyclePhase::Unloaded)?;
        state.lifecycle.current_model_id = None;
        Ok(())
    }

    async fn wait_cooldown(&self) -> Duration {
        let delay = self.inner.config.transition_delay();
        let last = self.inner.state.lock().last_transition;
        let Some(last) = last else {
            return Duration::ZERO;
        };
        let ready_at = last + delay;
        let now = Instant::now();
        if ready_at <= now {
            return Duration::ZERO;
        }
        let wait = ready_at - now;
        debug!(?wait, "waiting for transition cooldown");
        tokio::time::sleep_until(ready_at).await;
        wait
    }
}

/// Marks a transition in flight; cleared on every exit path.
///
/// If dropped mid-transition (cancellation), the model state is unknown
/// and is reset to unloaded so the next request reloads.
struct InFlight<'a>(&'a Mutex<DeviceState>);

impl<'a> InFlight<'a> {
    fn begin(state: &'a Mutex<DeviceState>) -> Self {
        state.lock().transition_in_flight = true;
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.transition_in_flight = false;
        if state.lifecycle.phase.is_transitional() {
            warn!(phase = ?state.lifecycle.phase, "transition abandoned, marking model unloaded");
            state.lifecycle.phase = LifecyclePhase::Unloaded;
            state.lifecycle.current_model_id = None;
            state.lifecycle.last_transition_at = Some(Utc::now());
            state.last_transition = Some(Instant::now());
        }
    }
}

/// A granted local slot
///
/// Dropping the grant releases the slot on every exit path, including
/// task cancellation and outer timeouts.
pub struct SlotGrant {
    estimated_mb: u64,
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGrant {
    /// Estimate the grant was admitted for
    #[inline]
    #[must_use]
    pub const fn estimated_mb(&self) -> u64 {
        self.estimated_mb
    }
}

impl std::fmt::Debug for SlotGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGrant")
            .field("estimated_mb", &self.estimated_mb)
            .finish_non_exhaustive()
    }
}

impl Drop for SlotGrant {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        debug!(in_use = state.in_use, "local slot released");
    }
}
