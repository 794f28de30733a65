//! Request fingerprints
//!
//! A [`Fingerprint`] is the cache key of a generation request: the Blake3
//! hash of its normalized form. Requests that only differ in whitespace,
//! style casing, or guidance noise below 1e-3 collide; any other difference
//! does not.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, HashError};
use crate::request::{GenerationRequest, ProviderPreference};

/// Canonical form of a [`GenerationRequest`] used for hashing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// Guidance scale in thousandths
    pub guidance_milli: i64,
    pub style: Option<String>,
    pub provider: ProviderPreference,
    pub seed: Option<u64>,
}

impl NormalizedRequest {
    /// Normalize a request
    #[must_use]
    pub fn from_request(request: &GenerationRequest) -> Self {
        let negative_prompt = request
            .negative_prompt
            .as_deref()
            .map(collapse_whitespace)
            .filter(|s| !s.is_empty());
        let style = request
            .style
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        #[allow(clippy::cast_possible_truncation)]
        let guidance_milli = (f64::from(request.guidance_scale) * 1000.0).round() as i64;

        Self {
            prompt: collapse_whitespace(&request.prompt),
            negative_prompt,
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance_milli,
            style,
            provider: request.provider_preference,
            seed: request.seed,
        }
    }
}

/// Trim and collapse runs of whitespace to single spaces
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic cache key of a generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(ContentHash);

impl Fingerprint {
    /// Fingerprint a request
    ///
    /// # Errors
    /// Returns error if the normalized form cannot be serialized
    pub fn of(request: &GenerationRequest) -> Result<Self, HashError> {
        let normalized = NormalizedRequest::from_request(request);
        ContentHash::compute_serializable(&normalized).map(Self)
    }

    /// Wrap an existing hash
    #[inline]
    #[must_use]
    pub const fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Underlying hash
    #[inline]
    #[must_use]
    pub const fn hash(&self) -> &ContentHash {
        &self.0
    }

    /// Short form for logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for Fingerprint {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}
