//! Generation requests
//!
//! [`GenerationRequest`] is the inbound contract of the orchestrator. It is
//! validated before any resource is touched and normalized before it is
//! fingerprinted.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Allowed prompt length in characters (after trimming)
pub const PROMPT_CHARS: RangeInclusive<usize> = 10..=1000;
/// Maximum negative prompt length in characters
pub const NEGATIVE_PROMPT_MAX_CHARS: usize = 500;
/// Allowed width and height in pixels
pub const DIMENSION_RANGE: RangeInclusive<u32> = 256..=2048;
/// Allowed denoising step count
pub const STEPS_RANGE: RangeInclusive<u32> = 1..=50;
/// Allowed classifier-free guidance scale
pub const GUIDANCE_RANGE: RangeInclusive<f32> = 1.0..=20.0;
/// Most regenerations a single request may ask for
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Which concrete provider produced (or should produce) an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Diffusion model resident on the local GPU
    Local,
    /// Vendor image API reached over the network
    Remote,
}

impl ProviderKind {
    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Remote => "remote",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller's provider preference for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPreference {
    /// Use the configured provider order
    #[default]
    Auto,
    /// Try local first, then fall back to the others
    Local,
    /// Try remote first, then fall back to the others
    Remote,
    /// Local device only, never fall back
    LocalOnly,
    /// Remote API only, never fall back
    RemoteOnly,
}

impl ProviderPreference {
    /// Resolve the preference against a configured order.
    ///
    /// The returned list never contains duplicates.
    #[must_use]
    pub fn resolve(self, configured: &[ProviderKind]) -> Vec<ProviderKind> {
        let mut order: Vec<ProviderKind> = match self {
            ProviderPreference::Auto => configured.to_vec(),
            ProviderPreference::Local => {
                let mut v = vec![ProviderKind::Local];
                v.extend(configured.iter().copied());
                v
            }
            ProviderPreference::Remote => {
                let mut v = vec![ProviderKind::Remote];
                v.extend(configured.iter().copied());
                v
            }
            ProviderPreference::LocalOnly => vec![ProviderKind::Local],
            ProviderPreference::RemoteOnly => vec![ProviderKind::Remote],
        };
        let mut seen = Vec::with_capacity(order.len());
        order.retain(|kind| {
            if seen.contains(kind) {
                false
            } else {
                seen.push(*kind);
                true
            }
        });
        order
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProviderPreference::Auto => "auto",
            ProviderPreference::Local => "local",
            ProviderPreference::Remote => "remote",
            ProviderPreference::LocalOnly => "local_only",
            ProviderPreference::RemoteOnly => "remote_only",
        }
    }
}

impl FromStr for ProviderPreference {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "local_only" => Ok(Self::LocalOnly),
            "remote_only" => Ok(Self::RemoteOnly),
            other => Err(RequestError::UnknownPreference(other.to_string())),
        }
    }
}

/// A request to generate one illustrative image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Positive prompt
    pub prompt: String,
    /// Things the image must not contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Denoising steps
    pub steps: u32,
    /// Classifier-free guidance scale
    pub guidance_scale: f32,
    /// Named style preset merged into the prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Provider preference
    #[serde(default)]
    pub provider_preference: ProviderPreference,
    /// Maximum number of quality-driven regenerations
    pub max_retries: u32,
    /// Fixed seed for reproducible local generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Create a request with the given prompt and common defaults
    /// (1024x1024, 8 steps, guidance 3.5, 3 retries).
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: 1024,
            height: 1024,
            steps: 8,
            guidance_scale: 3.5,
            style: None,
            provider_preference: ProviderPreference::Auto,
            max_retries: 3,
            seed: None,
        }
    }

    /// With negative prompt
    #[must_use]
    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    /// With dimensions
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// With step count
    #[must_use]
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// With guidance scale
    #[must_use]
    pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    /// With style preset name
    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// With provider preference
    #[must_use]
    pub fn with_provider_preference(mut self, preference: ProviderPreference) -> Self {
        self.provider_preference = preference;
        self
    }

    /// With retry bound
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// With fixed seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Pixel count in megapixels
    #[inline]
    #[must_use]
    pub fn megapixels(&self) -> f64 {
        f64::from(self.width) * f64::from(self.height) / 1_000_000.0
    }

    /// Check the request against the inbound bounds.
    ///
    /// # Errors
    /// Returns the first violated bound.
    pub fn validate(&self) -> Result<(), RequestError> {
        let prompt_chars = self.prompt.trim().chars().count();
        if !PROMPT_CHARS.contains(&prompt_chars) {
            return Err(RequestError::PromptLength {
                actual: prompt_chars,
            });
        }

        if let Some(negative) = &self.negative_prompt {
            let chars = negative.trim().chars().count();
            if chars > NEGATIVE_PROMPT_MAX_CHARS {
                return Err(RequestError::NegativePromptLength { actual: chars });
            }
        }

        for (field, value) in [("width", self.width), ("height", self.height)] {
            if !DIMENSION_RANGE.contains(&value) {
                return Err(RequestError::OutOfRange {
                    field,
                    value: value.to_string(),
                    range: format!("{}..={}", DIMENSION_RANGE.start(), DIMENSION_RANGE.end()),
                });
            }
        }

        if !STEPS_RANGE.contains(&self.steps) {
            return Err(RequestError::OutOfRange {
                field: "steps",
                value: self.steps.to_string(),
                range: format!("{}..={}", STEPS_RANGE.start(), STEPS_RANGE.end()),
            });
        }

        if !self.guidance_scale.is_finite() || !GUIDANCE_RANGE.contains(&self.guidance_scale) {
            return Err(RequestError::OutOfRange {
                field: "guidance_scale",
                value: self.guidance_scale.to_string(),
                range: format!("{}..={}", GUIDANCE_RANGE.start(), GUIDANCE_RANGE.end()),
            });
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(RequestError::OutOfRange {
                field: "max_retries",
                value: self.max_retries.to_string(),
                range: format!("0..={MAX_RETRIES_LIMIT}"),
            });
        }

        if let Some(style) = &self.style {
            if style.trim().is_empty() {
                return Err(RequestError::EmptyStyle);
            }
        }

        Ok(())
    }
}

/// Request validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Prompt too short or too long
    #[error("prompt must be {min}..={max} characters, got {actual}", min = PROMPT_CHARS.start(), max = PROMPT_CHARS.end())]
    PromptLength { actual: usize },

    /// Negative prompt too long
    #[error("negative prompt must be at most {NEGATIVE_PROMPT_MAX_CHARS} characters, got {actual}")]
    NegativePromptLength { actual: usize },

    /// Numeric field outside its range
    #[error("{field} = {value} is outside {range}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: String,
    },

    /// Style given but blank
    #[error("style preset name is empty")]
    EmptyStyle,

    /// Unrecognized provider preference
    #[error("unknown provider preference: {0}")]
    UnknownPreference(String),
}
