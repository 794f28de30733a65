//! Pictor Core
//!
//! Turns a [`GenerationRequest`](pictor_artifact::GenerationRequest) into an
//! accepted image:
//!
//! - Checks the content-addressed cache
//! - Admits the request to a provider (local GPU first, remote fallback)
//! - Generates, critiques, and retries with a steered negative prompt
//! - Stores validated images and reports every outcome to a [`ResultSink`]
//!
//! # Example
//!
//! ```rust,ignore
//! let config = PictorConfig::load("pictor.toml")?;
//! let orchestrator = Orchestrator::from_config(config).await?;
//! let result = orchestrator
//!     .generate(GenerationRequest::new("isometric data center").with_style("corporate_flat"))
//!     .await?;
//! println!("{} ({:?})", result.final_status, result.score_total());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod sink;
pub mod types;

pub use config::{GenerationDefaults, PictorConfig, StylePreset};
pub use error::{PictorError, ProviderDenial};
pub use orchestrator::Orchestrator;
pub use prompt::{apply_style, merge_negative, mutate_for_retry};
pub use sink::{GenerationRecord, JsonLinesSink, ResultSink, SinkError};
pub use types::{GenerationAttempt, GenerationResult, GenerationStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the orchestrator
    pub use crate::{
        GenerationResult, GenerationStatus, Orchestrator, PictorConfig, PictorError, ResultSink,
    };
    pub use pictor_artifact::{GenerationRequest, ProviderKind, ProviderPreference};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
