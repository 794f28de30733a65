//! Cache errors
//!
//! All cache errors are non-fatal to generation: callers log them and
//! carry on as if the cache had missed.

use std::path::PathBuf;

use pictor_artifact::ArtifactError;

/// Cache operation errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache sidecar serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Artifact alone exceeds the whole budget
    #[error("entry of {size_bytes} bytes exceeds cache budget of {budget_bytes} bytes")]
    EntryTooLarge { size_bytes: u64, budget_bytes: u64 },

    #[error("cached artifact invalid: {0}")]
    Artifact(#[from] ArtifactError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
