use std::collections::BTreeSet;

use super::{RiskFinding, Span};

/// Merge near-duplicate findings until no qualifying pair remains.
///
/// Two findings qualify when they share a category and either their descriptions are
/// similar enough or their spans overlap by more than `span_overlap_threshold` of the
/// shorter span.
pub fn deduplicate(
    mut findings: Vec<RiskFinding>,
    similarity_threshold: f32,
    span_overlap_threshold: f32,
) -> Vec<RiskFinding> {
    loop {
        let pair = find_duplicate(&findings, similarity_threshold, span_overlap_threshold);
        let Some((keep, duplicate)) = pair else {
            break;
        };
        let other = findings.remove(duplicate);
        let merged = merge(findings[keep].clone(), other);
        findings[keep] = merged;
    }
    findings
}

fn find_duplicate(
    findings: &[RiskFinding],
    similarity_threshold: f32,
    span_overlap_threshold: f32,
) -> Option<(usize, usize)> {
    for (i, a) in findings.iter().enumerate() {
        let words_a = word_set(&a.description);
        for (offset, b) in findings[i + 1..].iter().enumerate() {
            if a.category != b.category {
                continue;
            }
            let similar = jaccard(&words_a, &word_set(&b.description)) >= similarity_threshold;
            let overlapping = match (a.source_span, b.source_span) {
                (Some(x), Some(y)) => span_overlap(x, y) > span_overlap_threshold,
                _ => false,
            };
            if similar || overlapping {
                return Some((i, i + 1 + offset));
            }
        }
    }
    None
}

fn merge(a: RiskFinding, b: RiskFinding) -> RiskFinding {
    let (mut winner, loser) = if b.confidence > a.confidence { (b, a) } else { (a, b) };
    winner.confidence = winner.confidence.max(loser.confidence);
    if winner.source_span.is_none() {
        winner.source_span = loser.source_span;
    }
    for recommendation in loser.recommendations {
        if !winner.recommendations.contains(&recommendation) {
            winner.recommendations.push(recommendation);
        }
    }
    winner
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard index of two word sets; zero when both are empty.
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Shared length divided by the shorter span's length.
fn span_overlap(a: Span, b: Span) -> f32 {
    let shorter = a.1.saturating_sub(a.0).min(b.1.saturating_sub(b.0));
    if shorter == 0 {
        return 0.0;
    }
    let shared = a.1.min(b.1).saturating_sub(a.0.max(b.0));
    shared as f32 / shorter as f32
}
