//! Critic errors

/// The image could not be evaluated
///
/// Distinct from a `REGENERATE` verdict: callers must be able to tell
/// "rejected by the quality gate" from "never scored".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CritiqueError {
    /// Connection refused, timeout, or a server-side error
    #[error("scoring backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend answered with something that is not a score sheet
    #[error("malformed scoring response: {0}")]
    MalformedResponse(String),
}

impl CritiqueError {
    /// Transient failures are worth asking again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnreachable(_))
    }
}
