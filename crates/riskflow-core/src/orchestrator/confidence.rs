//! Confidence estimate for responses that do not report one.

use once_cell::sync::Lazy;
use regex::Regex;

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*•]|\d+[.)])\s+").expect("static regex"));

static LEGAL_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:clause|liabilit(?:y|ies)|indemnif\w*|terminat\w*|breach|warrant\w*",
        r"|jurisdiction|obligations?|covenant)\b",
    ))
    .expect("static regex")
});

/// Score response text on 0.0–1.0 by length and structure.
pub fn derive_confidence(text: &str) -> f32 {
    let text = text.trim();
    let chars = text.chars().count();
    if chars < 10 {
        return 0.0;
    }

    let mut score: f32 = 0.5;
    if chars > 100 {
        score += 0.2;
    }
    if chars > 500 {
        score += 0.1;
    }
    if looks_like_json(text) {
        score += 0.1;
    }
    if LIST_MARKER.is_match(text) {
        score += 0.1;
    }
    if LEGAL_TERMS.is_match(text) {
        score += 0.1;
    }
    score.min(1.0)
}

fn looks_like_json(text: &str) -> bool {
    let payload = crate::extract::parse::extract_json_payload(text);
    payload.starts_with('{') && serde_json::from_str::<serde_json::Value>(&payload).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_has_no_confidence() {
        assert_eq!(derive_confidence(""), 0.0);
        assert_eq!(derive_confidence("  ok  "), 0.0);
    }

    #[test]
    fn plain_sentence_gets_base_score() {
        let neutral = derive_confidence("nothing notable here");
        assert!((neutral - 0.5).abs() < 1e-6);
    }

    #[test]
    fn structure_and_vocabulary_raise_the_score() {
        let body = format!(
            "{{\"summary\": \"{}\", \"findings\": []}}",
            "the indemnification clause is one-sided ".repeat(4)
        );
        // length > 100, json, legal vocabulary
        assert!((derive_confidence(&body) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn score_is_capped() {
        let text = format!(
            "Findings:\n- liability clause\n{}\n{{\"notes\": \"x\"}}",
            "breach of warranty ".repeat(40)
        );
        assert_eq!(derive_confidence(&text), 1.0);
    }
}
