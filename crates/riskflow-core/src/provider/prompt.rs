use std::collections::BTreeSet;
use std::fmt::Write;

use crate::preprocess::TextSegment;
use crate::task::{AnalysisType, RiskCategory};

pub const SYSTEM_PROMPT: &str = "You are a contract risk analyst. Identify clauses that create \
liability, financial exposure, or operational constraints for the reader. Respond with ONLY strict \
JSON of the form {\"findings\": [{\"category\": \
\"liability|indemnification|termination|payment|intellectual_property|confidentiality|\
data_protection|governing_law|dispute_resolution|force_majeure|warranty|compliance|other\", \
\"severity\": 0-100, \"description\": \"...\", \"confidence\": 0.0-1.0, \"segment\": <segment \
number>, \"start\": <byte offset within the segment>, \"end\": <byte offset within the segment>, \
\"clause_text\": \"exact clause text\", \"recommendations\": [\"...\"]}], \"confidence\": 0.0-1.0, \
\"summary\": \"...\"}. Return an empty findings array when the document carries no notable risk.";

pub const MAX_OUTPUT_TOKENS: u32 = 2_048;
pub const TEMPERATURE: f32 = 0.1;

fn depth_instruction(analysis_type: AnalysisType) -> &'static str {
    match analysis_type {
        AnalysisType::Quick => "Report only the most significant risks; skip boilerplate.",
        AnalysisType::Comprehensive => {
            "Report every risky clause, including minor ones, with concrete recommendations."
        }
        AnalysisType::Custom => "Report risks strictly limited to the requested categories.",
    }
}

/// User message listing every segment under a numbered header.
pub fn user_prompt(
    segments: &[TextSegment],
    analysis_type: AnalysisType,
    risk_categories: &BTreeSet<RiskCategory>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(depth_instruction(analysis_type));
    prompt.push('\n');
    if risk_categories.is_empty() {
        prompt.push_str("Categories: all.\n");
    } else {
        let names: Vec<&str> = risk_categories.iter().map(|c| c.as_str()).collect();
        let _ = writeln!(prompt, "Categories: {}.", names.join(", "));
    }
    for segment in segments {
        let _ = write!(prompt, "\n[segment {}]\n{}\n", segment.index, segment.text);
    }
    prompt
}
