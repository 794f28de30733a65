//! Image artifacts
//!
//! [`ImageArtifact`] is an encoded image together with its sniffed format,
//! pixel dimensions and content hash. Construction decodes only the header,
//! so bytes that are not a supported image are rejected up front.

use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Supported encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Png,
    Jpeg,
    Webp,
}

impl MediaType {
    /// File extension without the dot
    #[inline]
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            MediaType::Png => "png",
            MediaType::Jpeg => "jpg",
            MediaType::Webp => "webp",
        }
    }

    /// MIME type
    #[inline]
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            MediaType::Png => "image/png",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Webp => "image/webp",
        }
    }

    fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(MediaType::Png),
            ImageFormat::Jpeg => Some(MediaType::Jpeg),
            ImageFormat::WebP => Some(MediaType::Webp),
            _ => None,
        }
    }
}

/// An encoded image, content addressed
///
/// # Invariants
/// - `hash` is always the Blake3 hash of `bytes`
/// - `width`/`height` are read from the encoded header
/// - Cheap to clone (bytes are shared)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    bytes: Arc<[u8]>,
    media_type: MediaType,
    width: u32,
    height: u32,
    hash: ContentHash,
}

impl ImageArtifact {
    /// Sniff and validate encoded image bytes
    ///
    /// # Errors
    /// Returns error if the bytes are empty, not a recognised format, or
    /// the header cannot be decoded
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, ArtifactError> {
        let bytes: Vec<u8> = bytes.into();
        if bytes.is_empty() {
            return Err(ArtifactError::Empty);
        }

        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| ArtifactError::Decode(e.to_string()))?;
        let media_type = reader
            .format()
            .and_then(MediaType::from_format)
            .ok_or(ArtifactError::UnsupportedFormat)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ArtifactError::Decode(e.to_string()))?;

        let hash = ContentHash::compute(&bytes);
        Ok(Self {
            bytes: bytes.into(),
            media_type,
            width,
            height,
            hash,
        })
    }

    /// Load and check against an expected hash
    ///
    /// # Errors
    /// Returns [`ArtifactError::HashMismatch`] if the content has changed
    pub fn from_bytes_verified(
        bytes: impl Into<Vec<u8>>,
        expected: &ContentHash,
    ) -> Result<Self, ArtifactError> {
        let artifact = Self::from_bytes(bytes)?;
        if artifact.hash != *expected {
            return Err(ArtifactError::HashMismatch {
                expected: *expected,
                actual: artifact.hash,
            });
        }
        Ok(artifact)
    }

    /// Encoded bytes
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded size in bytes
    #[inline]
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Encoding
    #[inline]
    #[must_use]
    pub const fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Width in pixels
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Content hash of the encoded bytes
    #[inline]
    #[must_use]
    pub const fn hash(&self) -> &ContentHash {
        &self.hash
    }
}

/// Errors building an [`ImageArtifact`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("image payload is empty")]
    Empty,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("image decode error: {0}")]
    Decode(String),

    /// Integrity check failed
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}
