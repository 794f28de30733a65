//! Pictor Quality Critic
//!
//! Scores a candidate image on five criteria and issues a verdict:
//!
//! - sharpness, composition, no_text, coherence, professionalism, each `0..=10`
//! - `score_total` is their sum (`0..=50`)
//! - `VALID` iff `score_total >= threshold` (default 35) and no unwanted
//!   text was detected, otherwise `REGENERATE`
//!
//! Problems and suggestions are returned with every verdict; the
//! orchestrator folds the suggestions into the next attempt's negative
//! prompt. A backend that cannot be reached yields a [`CritiqueError`],
//! never a neutral score.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod backend;
mod critic;
mod error;
mod score;

pub use backend::{HttpScoringBackend, RawScores, ScoringBackend};
pub use critic::{normalize, CriticConfig, QualityCritic, TEXT_DETECTED_NO_TEXT_CAP, WEAK_SCORE};
pub use error::CritiqueError;
pub use score::{
    Criterion, CriterionScores, CritiqueResult, Verdict, DEFAULT_THRESHOLD, MAX_CRITERION_SCORE,
    MAX_TOTAL_SCORE,
};
