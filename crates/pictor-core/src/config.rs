//! Configuration
//!
//! One TOML document with a section per component. Every section has
//! defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! provider_order = ["local", "remote"]
//! accept_unevaluated = false
//!
//! [generation]
//! width = 1024
//! height = 1024
//! steps = 8
//!
//! [resource]
//! safety_margin_mb = 1024
//! transition_delay_ms = 2000
//!
//! [cache]
//! directory = ".pictor/cache"
//! max_size_bytes = 536870912
//!
//! [critic]
//! threshold = 35
//!
//! [styles.corporate_flat]
//! prompt_suffix = "flat vector illustration, corporate palette"
//! negative_prompt = "photorealistic, 3d render"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use pictor_artifact::{
    GenerationRequest, ProviderKind, ProviderPreference, DIMENSION_RANGE, GUIDANCE_RANGE,
    MAX_RETRIES_LIMIT, STEPS_RANGE,
};
use pictor_cache::CacheConfig;
use pictor_critic::{CriticConfig, MAX_TOTAL_SCORE};
use pictor_providers::{LocalProviderConfig, RemoteProviderConfig};
use pictor_resource::ResourceConfig;
use serde::{Deserialize, Serialize};

use crate::error::PictorError;

/// Defaults applied to requests built from a bare prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub max_retries: u32,
    pub style: Option<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 8,
            guidance_scale: 3.5,
            max_retries: 3,
            style: None,
        }
    }
}

impl GenerationDefaults {
    /// Request for `prompt` with these defaults
    #[must_use]
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt)
            .with_size(self.width, self.height)
            .with_steps(self.steps)
            .with_guidance_scale(self.guidance_scale)
            .with_max_retries(self.max_retries)
            .with_provider_preference(ProviderPreference::Auto);
        request.style.clone_from(&self.style);
        request
    }
}

/// Named bundle merged into a request's prompts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StylePreset {
    /// Appended to the prompt
    pub prompt_suffix: String,
    /// Comma-separated terms merged into the negative prompt
    pub negative_prompt: String,
}

impl StylePreset {
    #[must_use]
    pub fn new(prompt_suffix: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt_suffix: prompt_suffix.into(),
            negative_prompt: negative_prompt.into(),
        }
    }
}

fn default_styles() -> BTreeMap<String, StylePreset> {
    BTreeMap::from([
        (
            "corporate_flat".to_string(),
            StylePreset::new(
                "flat vector illustration, corporate color palette, clean geometric shapes",
                "photorealistic, 3d render, gradients",
            ),
        ),
        (
            "isometric".to_string(),
            StylePreset::new(
                "isometric illustration, soft shadows, consistent perspective",
                "perspective distortion, photo",
            ),
        ),
        (
            "technical_diagram".to_string(),
            StylePreset::new(
                "clean technical diagram, simple shapes, white background",
                "clutter, decorative background",
            ),
        ),
        (
            "minimal".to_string(),
            StylePreset::new(
                "minimalist illustration, generous negative space, two-tone",
                "busy background, noise",
            ),
        ),
    ])
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PictorConfig {
    pub generation: GenerationDefaults,
    pub resource: ResourceConfig,
    pub cache: CacheConfig,
    pub local: LocalProviderConfig,
    pub remote: RemoteProviderConfig,
    pub critic: CriticConfig,
    /// Provider order for `auto` requests
    pub provider_order: Vec<ProviderKind>,
    /// Return images the critic could not score as `UNEVALUATED`
    /// instead of failing the call
    pub accept_unevaluated: bool,
    pub styles: BTreeMap<String, StylePreset>,
}

impl Default for PictorConfig {
    fn default() -> Self {
        Self {
            generation: GenerationDefaults::default(),
            resource: ResourceConfig::default(),
            cache: CacheConfig::default(),
            local: LocalProviderConfig::default(),
            remote: RemoteProviderConfig::default(),
            critic: CriticConfig::default(),
            provider_order: vec![ProviderKind::Local, ProviderKind::Remote],
            accept_unevaluated: false,
            styles: default_styles(),
        }
    }
}

impl PictorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// [`PictorError::Configuration`] on syntax errors or invalid settings
    pub fn from_toml_str(text: &str) -> Result<Self, PictorError> {
        let mut config: Self = toml::from_str(text)
            .map_err(|e| PictorError::configuration(format!("invalid config: {e}")))?;
        // user presets extend the built-in ones
        for (name, preset) in default_styles() {
            config.styles.entry(name).or_insert(preset);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// [`PictorError::Configuration`] if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PictorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PictorError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// With provider order
    #[must_use]
    pub fn with_provider_order(mut self, order: Vec<ProviderKind>) -> Self {
        self.provider_order = order;
        self
    }

    /// With cache settings
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// With validity threshold
    #[must_use]
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.critic.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_accept_unevaluated(mut self, accept: bool) -> Self {
        self.accept_unevaluated = accept;
        self
    }

    /// With an additional (or replaced) style preset
    #[must_use]
    pub fn with_style(mut self, name: impl Into<String>, preset: StylePreset) -> Self {
        self.styles.insert(name.into(), preset);
        self
    }

    /// Look up a style preset, ignoring case and surrounding whitespace
    #[must_use]
    pub fn style(&self, name: &str) -> Option<&StylePreset> {
        let key = name.trim().to_lowercase();
        self.styles
            .iter()
            .find(|(k, _)| k.to_lowercase() == key)
            .map(|(_, preset)| preset)
    }

    /// Reject settings that can never work
    ///
    /// # Errors
    /// [`PictorError::Configuration`] naming the first bad setting
    pub fn validate(&self) -> Result<(), PictorError> {
        let fail = |msg: String| -> Result<(), PictorError> { Err(PictorError::Configuration(msg)) };

        if self.resource.capacity == 0 {
            return fail("resource.capacity must be at least 1".into());
        }
        if self.critic.threshold > MAX_TOTAL_SCORE {
            return fail(format!(
                "critic.threshold {} exceeds the maximum score {MAX_TOTAL_SCORE}",
                self.critic.threshold
            ));
        }
        if self.provider_order.is_empty() {
            return fail("provider_order must name at least one provider".into());
        }
        if self.cache.enabled && self.cache.max_size_bytes == 0 {
            return fail("cache.max_size_bytes must be positive when the cache is enabled".into());
        }
        if self.remote.max_attempts == 0 {
            return fail("remote.max_attempts must be at least 1".into());
        }

        let g = &self.generation;
        for (field, value) in [("width", g.width), ("height", g.height)] {
            if !DIMENSION_RANGE.contains(&value) {
                return fail(format!("generation.{field} = {value} is out of range"));
            }
        }
        if !STEPS_RANGE.contains(&g.steps) {
            return fail(format!("generation.steps = {} is out of range", g.steps));
        }
        if !GUIDANCE_RANGE.contains(&g.guidance_scale) {
            return fail(format!(
                "generation.guidance_scale = {} is out of range",
                g.guidance_scale
            ));
        }
        if g.max_retries > MAX_RETRIES_LIMIT {
            return fail(format!(
                "generation.max_retries = {} exceeds {MAX_RETRIES_LIMIT}",
                g.max_retries
            ));
        }
        if let Some(style) = &g.style {
            if self.style(style).is_none() {
                return fail(format!("generation.style {style:?} is not a known preset"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = PictorConfig::from_toml_str("").unwrap();
        assert_eq!(config, PictorConfig::default());
        assert_eq!(config.critic.threshold, 35);
        assert_eq!(
            config.provider_order,
            vec![ProviderKind::Local, ProviderKind::Remote]
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config = PictorConfig::from_toml_str(
            r#"
            provider_order = ["remote"]
            accept_unevaluated = true

            [generation]
            steps = 20
            style = "Corporate_Flat"

            [resource]
            safety_margin_mb = 2048

            [cache]
            enabled = false

            [styles.blueprint]
            prompt_suffix = "blueprint style"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider_order, vec![ProviderKind::Remote]);
        assert!(config.accept_unevaluated);
        assert_eq!(config.generation.steps, 20);
        assert_eq!(config.generation.width, 1024);
        assert_eq!(config.resource.safety_margin_mb, 2048);
        assert!(!config.cache.enabled);
        assert!(config.style("blueprint").is_some());
        assert!(config.style("corporate_flat").is_some());
    }

    #[test]
    fn nonsense_is_rejected() {
        for doc in [
            "provider_order = []",
            "[critic]\nthreshold = 51",
            "[resource]\ncapacity = 0",
            "[generation]\nsteps = 0",
            "[generation]\nstyle = \"baroque\"",
            "[cache]\nmax_size_bytes = 0",
            "[generation]\nmax_retries = 4294967295",
            "provider_order = [\"cloud\"]",
        ] {
            assert!(
                matches!(
                    PictorConfig::from_toml_str(doc),
                    Err(PictorError::Configuration(_))
                ),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn defaults_build_valid_requests() {
        let defaults = GenerationDefaults {
            style: Some("minimal".into()),
            ..GenerationDefaults::default()
        };
        let request = defaults.request("a calm illustration of a message queue");
        request.validate().unwrap();
        assert_eq!(request.style.as_deref(), Some("minimal"));
        assert_eq!(request.max_retries, 3);
    }
}
