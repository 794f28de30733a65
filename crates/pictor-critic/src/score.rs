//! Score sheet types
//!
//! Every constructor of [`CritiqueResult`] goes through
//! [`CritiqueResult::new`], which derives `score_total` and `verdict` from
//! the sub-scores so the two can never disagree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest score a single criterion can receive
pub const MAX_CRITERION_SCORE: u8 = 10;

/// Highest possible total over all five criteria
pub const MAX_TOTAL_SCORE: u8 = MAX_CRITERION_SCORE * 5;

/// Default acceptance threshold out of [`MAX_TOTAL_SCORE`]
pub const DEFAULT_THRESHOLD: u8 = 35;

/// One scoring axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Sharpness,
    Composition,
    NoText,
    Coherence,
    Professionalism,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::Sharpness,
        Criterion::Composition,
        Criterion::NoText,
        Criterion::Coherence,
        Criterion::Professionalism,
    ];

    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Criterion::Sharpness => "sharpness",
            Criterion::Composition => "composition",
            Criterion::NoText => "no_text",
            Criterion::Coherence => "coherence",
            Criterion::Professionalism => "professionalism",
        }
    }

    /// Negative-prompt terms that steer away from a weak score here
    #[must_use]
    pub const fn remedy(self) -> &'static str {
        match self {
            Criterion::Sharpness => "blurry, out of focus, low resolution",
            Criterion::Composition => "cluttered, unbalanced composition, cropped subject",
            Criterion::NoText => "text, letters, words, watermark",
            Criterion::Coherence => "distorted shapes, incoherent details, artifacts",
            Criterion::Professionalism => "amateurish, low quality, clip art",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five integer sub-scores, each in `0..=10`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CriterionScores {
    pub sharpness: u8,
    pub composition: u8,
    pub no_text: u8,
    pub coherence: u8,
    pub professionalism: u8,
}

impl CriterionScores {
    /// Scores are clamped to the criterion maximum
    #[must_use]
    pub fn new(
        sharpness: u8,
        composition: u8,
        no_text: u8,
        coherence: u8,
        professionalism: u8,
    ) -> Self {
        let c = |v: u8| v.min(MAX_CRITERION_SCORE);
        Self {
            sharpness: c(sharpness),
            composition: c(composition),
            no_text: c(no_text),
            coherence: c(coherence),
            professionalism: c(professionalism),
        }
    }

    #[must_use]
    pub const fn get(&self, criterion: Criterion) -> u8 {
        match criterion {
            Criterion::Sharpness => self.sharpness,
            Criterion::Composition => self.composition,
            Criterion::NoText => self.no_text,
            Criterion::Coherence => self.coherence,
            Criterion::Professionalism => self.professionalism,
        }
    }

    /// Sum of the five sub-scores
    #[must_use]
    pub fn total(&self) -> u8 {
        Criterion::ALL.iter().map(|c| self.get(*c)).sum()
    }

    /// Criteria in declaration order with their scores
    pub fn iter(&self) -> impl Iterator<Item = (Criterion, u8)> + '_ {
        Criterion::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

/// Accept or try again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Valid,
    Regenerate,
}

impl Verdict {
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Valid => "VALID",
            Verdict::Regenerate => "REGENERATE",
        })
    }
}

/// Outcome of one critique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueResult {
    #[serde(flatten)]
    pub scores: CriterionScores,
    pub score_total: u8,
    pub verdict: Verdict,
    pub has_unwanted_text: bool,
    pub problems: Vec<String>,
    pub suggestions: Vec<String>,
}

impl CritiqueResult {
    /// Build a result; the verdict is `VALID` iff the total reaches
    /// `threshold` and no unwanted text was detected
    #[must_use]
    pub fn new(
        scores: CriterionScores,
        has_unwanted_text: bool,
        threshold: u8,
        problems: Vec<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let score_total = scores.total();
        let verdict = if score_total >= threshold && !has_unwanted_text {
            Verdict::Valid
        } else {
            Verdict::Regenerate
        };
        Self {
            scores,
            score_total,
            verdict,
            has_unwanted_text,
            problems,
            suggestions,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.verdict.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_needs_threshold_and_no_text() {
        let scores = CriterionScores::new(8, 8, 9, 9, 8);
        assert_eq!(scores.total(), 42);

        let ok = CritiqueResult::new(scores, false, DEFAULT_THRESHOLD, vec![], vec![]);
        assert_eq!(ok.verdict, Verdict::Valid);

        let text = CritiqueResult::new(scores, true, DEFAULT_THRESHOLD, vec![], vec![]);
        assert_eq!(text.verdict, Verdict::Regenerate);

        let low = CritiqueResult::new(
            CriterionScores::new(7, 7, 7, 7, 6),
            false,
            DEFAULT_THRESHOLD,
            vec![],
            vec![],
        );
        assert_eq!(low.score_total, 34);
        assert_eq!(low.verdict, Verdict::Regenerate);
    }

    #[test]
    fn threshold_is_inclusive() {
        let at = CritiqueResult::new(
            CriterionScores::new(7, 7, 7, 7, 7),
            false,
            DEFAULT_THRESHOLD,
            vec![],
            vec![],
        );
        assert!(at.is_valid());
    }

    #[test]
    fn scores_are_clamped() {
        let scores = CriterionScores::new(200, 11, 10, 0, 3);
        assert_eq!(scores.sharpness, 10);
        assert_eq!(scores.composition, 10);
        assert_eq!(scores.total(), 33);
    }

    #[test]
    fn serializes_flat_with_uppercase_verdict() {
        let result = CritiqueResult::new(
            CriterionScores::new(8, 8, 9, 9, 8),
            false,
            DEFAULT_THRESHOLD,
            vec![],
            vec![],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verdict"], "VALID");
        assert_eq!(json["no_text"], 9);
        assert_eq!(json["score_total"], 42);
    }
}
