//! Testing utilities for the Pictor workspace
//!
//! Scripted providers, scoring backends and VRAM probes, plus PNG fixtures.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgb};
use parking_lot::Mutex;
use pictor_artifact::{GenerationRequest, ImageArtifact, ProviderKind};
use pictor_critic::{CritiqueError, RawScores, ScoringBackend};
use pictor_providers::{
    FailureKind, ImageProvider, ProviderFailure, ProviderLease, ProviderMetadata, ProviderOutput,
};
use pictor_resource::{DenialReason, ProbeError, VramProbe, VramStatus};

/// Encoded PNG of a solid color
pub fn png_with_color(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    png_with_color(width, height, [128, 128, 128])
}

/// Distinct small image per `n`
pub fn test_artifact(n: u8) -> ImageArtifact {
    ImageArtifact::from_bytes(png_with_color(16, 16, [n, 255 - n, 64])).unwrap()
}

/// A request that passes validation
pub fn test_request() -> GenerationRequest {
    GenerationRequest::new("isometric illustration of a distributed cache cluster")
}

/// Raw scores summing to `total`, with the remainder on the first criteria
pub fn raw_with_total(total: u8) -> RawScores {
    let base = f64::from(total / 5);
    let rem = total % 5;
    let s = |i: u8| if i < rem { base + 1.0 } else { base };
    RawScores::new(s(0), s(1), s(2), s(3), s(4))
}

/// VRAM probe returning a fixed status (or failure)
#[derive(Debug)]
pub struct StaticProbe {
    status: Mutex<Result<VramStatus, ProbeError>>,
}

impl StaticProbe {
    /// A 24 GiB device with `free_mb` free
    pub fn free(free_mb: u64) -> Self {
        Self {
            status: Mutex::new(Ok(VramStatus::new(
                24_576,
                24_576_u64.saturating_sub(free_mb),
                free_mb,
            ))),
        }
    }

    pub fn cpu_only() -> Self {
        Self {
            status: Mutex::new(Ok(VramStatus::cpu_only())),
        }
    }

    pub fn failing() -> Self {
        Self {
            status: Mutex::new(Err(ProbeError::Io("nvidia-smi crashed".into()))),
        }
    }

    pub fn set_free(&self, free_mb: u64) {
        *self.status.lock() = Ok(VramStatus::new(
            24_576,
            24_576_u64.saturating_sub(free_mb),
            free_mb,
        ));
    }
}

#[async_trait]
impl VramProbe for StaticProbe {
    async fn sample(&self) -> Result<VramStatus, ProbeError> {
        self.status.lock().clone()
    }
}

/// One scripted provider response
#[derive(Debug, Clone)]
pub enum Step {
    Image,
    Fail(FailureKind),
    /// Sleep before producing an image
    Slow(Duration),
}

/// Provider that replays a script
///
/// Once the script is exhausted every further call produces an image.
/// Each image differs so attempts can be told apart by hash.
#[derive(Debug)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    /// Admissions granted before every further one is denied
    denial: Option<(usize, DenialReason)>,
    timeout: Duration,
    script: Mutex<VecDeque<Step>>,
    admissions: AtomicUsize,
    generations: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            denial: None,
            timeout: Duration::from_secs(30),
            script: Mutex::new(VecDeque::new()),
            admissions: AtomicUsize::new(0),
            generations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn local() -> Self {
        Self::new(ProviderKind::Local)
    }

    pub fn remote() -> Self {
        Self::new(ProviderKind::Remote)
    }

    /// Deny every admission
    #[must_use]
    pub fn denying(self, reason: DenialReason) -> Self {
        self.denying_after(0, reason)
    }

    /// Admit `granted` times, then deny every admission
    #[must_use]
    pub fn denying_after(mut self, granted: usize, reason: DenialReason) -> Self {
        self.denial = Some((granted, reason));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn then(self, step: Step) -> Self {
        self.script.lock().push_back(step);
        self
    }

    #[must_use]
    pub fn then_fail(self, kind: FailureKind) -> Self {
        self.then(Step::Fail(kind))
    }

    pub fn admissions(&self) -> usize {
        self.admissions.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    /// Every request passed to `generate`, in order
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn admit(&self, _request: &GenerationRequest) -> Result<ProviderLease, DenialReason> {
        let previous = self.admissions.fetch_add(1, Ordering::SeqCst);
        match &self.denial {
            Some((granted, reason)) if previous >= *granted => Err(reason.clone()),
            _ => Ok(ProviderLease::Unmetered),
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _lease: ProviderLease,
    ) -> Result<ProviderOutput, ProviderFailure> {
        let n = self.generations.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let step = self.script.lock().pop_front().unwrap_or(Step::Image);
        match step {
            Step::Image => {}
            Step::Slow(delay) => tokio::time::sleep(delay).await,
            Step::Fail(kind) => {
                return Err(ProviderFailure::new(kind, self.kind, "scripted failure"));
            }
        }
        let offset = match self.kind {
            ProviderKind::Local => 0,
            ProviderKind::Remote => 50,
        };
        #[allow(clippy::cast_possible_truncation)]
        let image = test_artifact((n % 200) as u8 + offset);
        Ok(ProviderOutput {
            provider: self.kind,
            image,
            metadata: ProviderMetadata::new(format!("scripted-{}", self.kind))
                .with_extra("call", n + 1),
        })
    }
}

/// Scoring backend that replays scripted answers
///
/// The last answer repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedScorer {
    script: Mutex<VecDeque<Result<RawScores, CritiqueError>>>,
    last: Mutex<Option<Result<RawScores, CritiqueError>>>,
    calls: AtomicUsize,
}

impl ScriptedScorer {
    pub fn new(script: Vec<Result<RawScores, CritiqueError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Scores summing to each total in turn, no text detected
    pub fn totals(totals: &[u8]) -> Self {
        Self::new(totals.iter().map(|t| Ok(raw_with_total(*t))).collect())
    }

    pub fn unreachable() -> Self {
        Self::new(vec![Err(CritiqueError::BackendUnreachable(
            "connection refused".into(),
        ))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringBackend for ScriptedScorer {
    async fn score(&self, _image: &ImageArtifact, _prompt: &str) -> Result<RawScores, CritiqueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(answer) => {
                *self.last.lock() = Some(answer.clone());
                answer
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(raw_with_total(40))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_totals_add_up() {
        for total in [0u8, 20, 32, 38, 42, 50] {
            let raw = raw_with_total(total);
            let sum = raw.sharpness + raw.composition + raw.no_text + raw.coherence + raw.professionalism;
            assert!((sum - f64::from(total)).abs() < f64::EPSILON);
        }
    }
}
