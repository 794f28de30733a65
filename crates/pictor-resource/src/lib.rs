//! Pictor Resource Management
//!
//! Arbitrates the scarce local GPU.
//!
//! # Components
//!
//! - [`VramProbe`] / [`NvidiaSmiProbe`]: read-only memory sampling
//! - [`ResourceManager`]: capacity-limited admission with VRAM checks
//! - [`SlotGrant`]: RAII admission; dropping it releases the slot
//! - [`LifecyclePhase`] / [`ModelLifecycleState`]: the loaded-model state machine
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ResourceManager::new(ResourceConfig::default(), Arc::new(NvidiaSmiProbe::new(0)));
//! match manager.request_local_slot(6_000).await {
//!     Ok(grant) => {
//!         manager.load_model(&grant, "flux-schnell", &host).await?;
//!         // ... run the model while holding `grant`
//!     }
//!     Err(reason) => tracing::info!(%reason, "falling back to remote"),
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod lifecycle;
mod manager;
mod vram;

pub use error::{DenialReason, HostError, ProbeError, ResourceError};
pub use lifecycle::{
    allowed_transitions, validate_transition, LifecyclePhase, ModelHost, ModelLifecycleState,
};
pub use manager::{LoadOutcome, ResourceConfig, ResourceManager, SlotGrant};
pub use vram::{
    parse_memory_line, parse_process_lines, GpuProcess, NvidiaSmiProbe, VramProbe, VramStatus,
};
