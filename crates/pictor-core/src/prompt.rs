//! Prompt styling and retry mutation
//!
//! Negative prompts are treated as comma-separated term lists. Merging
//! keeps the caller's text verbatim, appends new terms once
//! (case-insensitively), and drops appended terms that would push the
//! text past [`NEGATIVE_PROMPT_MAX_CHARS`]. Existing text is never cut.

use std::collections::HashSet;

use pictor_artifact::{GenerationRequest, NEGATIVE_PROMPT_MAX_CHARS};
use pictor_critic::{Criterion, CritiqueResult};

use crate::config::StylePreset;

const SEPARATOR: &str = ", ";

fn split_terms(text: &str) -> impl Iterator<Item = &str> {
    text.split([',', '\n'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Merge `additions` into an existing negative prompt
#[must_use]
pub fn merge_negative<'a>(
    existing: Option<&str>,
    additions: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let base = existing
        .unwrap_or_default()
        .trim_matches(|c: char| c == ',' || c.is_whitespace());
    let mut merged = base.to_string();
    let mut len = base.chars().count();
    let mut seen: HashSet<String> = split_terms(base).map(str::to_lowercase).collect();

    for term in additions.into_iter().flat_map(split_terms) {
        let key = term.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        let extra = term.chars().count() + if merged.is_empty() { 0 } else { SEPARATOR.len() };
        if len + extra > NEGATIVE_PROMPT_MAX_CHARS {
            continue;
        }
        if !merged.is_empty() {
            merged.push_str(SEPARATOR);
        }
        merged.push_str(term);
        len += extra;
        seen.insert(key);
    }

    (!merged.is_empty()).then_some(merged)
}

/// Merge a style preset into a request
#[must_use]
pub fn apply_style(request: &GenerationRequest, preset: &StylePreset) -> GenerationRequest {
    let mut styled = request.clone();
    let suffix = preset.prompt_suffix.trim();
    if !suffix.is_empty() && !styled.prompt.trim_end().ends_with(suffix) {
        styled.prompt = format!("{}, {suffix}", styled.prompt.trim_end());
    }
    styled.negative_prompt = merge_negative(
        request.negative_prompt.as_deref(),
        [preset.negative_prompt.as_str()],
    );
    styled
}

/// Next attempt's request, steered away from what the critic disliked
#[must_use]
pub fn mutate_for_retry(request: &GenerationRequest, critique: &CritiqueResult) -> GenerationRequest {
    let mut additions: Vec<&str> = Vec::new();
    if critique.has_unwanted_text {
        additions.push(Criterion::NoText.remedy());
    }
    additions.extend(critique.suggestions.iter().map(String::as_str));

    let mut next = request.clone();
    next.negative_prompt = merge_negative(request.negative_prompt.as_deref(), additions);
    next
}
