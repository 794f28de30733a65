//! Pictor Artifact Types
//!
//! Requests, fingerprints and content-addressed images shared by every
//! other Pictor crate.
//!
//! # Core Concepts
//!
//! - [`GenerationRequest`]: validated inbound request
//! - [`Fingerprint`]: deterministic cache key over the normalized request
//! - [`ContentHash`]: 32-byte Blake3 hash for content addressing
//! - [`ImageArtifact`]: encoded image with sniffed format and dimensions
//!
//! # Example
//!
//! ```rust,ignore
//! use pictor_artifact::{Fingerprint, GenerationRequest};
//!
//! let request = GenerationRequest::new("flat illustration of a CI pipeline")
//!     .with_style("corporate_flat");
//! request.validate()?;
//! println!("key: {}", Fingerprint::of(&request)?);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod fingerprint;
mod hash;
mod request;

pub use fingerprint::{collapse_whitespace, Fingerprint, NormalizedRequest};
pub use hash::{ContentHash, HashError};
pub use artifact::{ArtifactError, ImageArtifact, MediaType};
pub use request::{
    GenerationRequest, ProviderKind, ProviderPreference, RequestError, DIMENSION_RANGE,
    GUIDANCE_RANGE, MAX_RETRIES_LIMIT, NEGATIVE_PROMPT_MAX_CHARS, PROMPT_CHARS, STEPS_RANGE,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
