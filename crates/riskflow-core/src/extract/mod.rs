//! Risk extraction and aggregation.
//!
//! Turns an accepted provider response into an [`AnalysisResult`]: findings are mapped
//! back onto the prepared text, severities normalised onto 0–100, near-duplicates
//! merged and the aggregate score computed as a confidence-weighted mean.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

pub mod dedup;
pub mod parse;

pub use dedup::deduplicate;
pub use parse::{parse_report, ParseError, ParsedFinding, ParsedReport, SeverityValue};

use crate::preprocess::TextSegment;
use crate::provider::RawModelOutput;
use crate::task::{RiskCategory, TaskSpec};

/// Byte span within the prepared text `(start, end)` where `start <= end`.
pub type Span = (usize, usize);

const MEDIUM_SEVERITY: f32 = 55.0;

/// Thresholds that map numeric scores into qualitative risk bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: f32,
    pub high: f32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 25.0,
            high: 60.0,
        }
    }
}

/// Classification buckets for the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub fn from_score(score: f32) -> Self {
        Self::from_score_with_thresholds(score, &RiskThresholds::default())
    }

    pub fn from_score_with_thresholds(score: f32, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.high {
            Self::High
        } else if score >= thresholds.medium {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Declared numeric severity scale of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityScale {
    /// 0–100.
    #[default]
    Percent,
    /// 0–10.
    Decimal,
    /// 0–1.
    Unit,
}

impl SeverityScale {
    /// Map a provider severity onto 0–100. Labels use a fixed table; numbers outside the
    /// declared scale are clamped and logged.
    pub fn normalize(self, value: Option<&SeverityValue>, provider: &str) -> f32 {
        let raw = match value {
            None => return MEDIUM_SEVERITY,
            Some(SeverityValue::Number(number)) => *number,
            Some(SeverityValue::Label(label)) => match label.trim().parse::<f64>() {
                Ok(number) => number,
                Err(_) => {
                    return label_severity(label).unwrap_or_else(|| {
                        warn!(provider, label = %label, "unknown severity label; using medium");
                        MEDIUM_SEVERITY
                    })
                }
            },
        };
        let scaled = match self {
            Self::Percent => raw,
            Self::Decimal => raw * 10.0,
            Self::Unit => raw * 100.0,
        };
        if !scaled.is_finite() {
            warn!(provider, "non-finite severity; using medium");
            return MEDIUM_SEVERITY;
        }
        if !(0.0..=100.0).contains(&scaled) {
            warn!(provider, raw, scale = ?self, "severity outside declared scale; clamping");
        }
        scaled.clamp(0.0, 100.0) as f32
    }
}

fn label_severity(label: &str) -> Option<f32> {
    match label.trim().to_ascii_lowercase().as_str() {
        "low" | "minor" => Some(25.0),
        "medium" | "moderate" => Some(MEDIUM_SEVERITY),
        "high" | "major" => Some(80.0),
        "critical" | "severe" => Some(95.0),
        _ => None,
    }
}

/// A single normalised risk finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFinding {
    pub category: RiskCategory,
    /// 0–100.
    pub severity: f32,
    pub description: String,
    /// 0.0–1.0.
    pub confidence: f32,
    /// `None` when the provider's reference could not be mapped onto the text.
    pub source_span: Option<Span>,
    pub recommendations: Vec<String>,
}

/// Result attached to a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub findings: Vec<RiskFinding>,
    pub aggregate_score: f32,
    pub risk_band: RiskBand,
    pub no_risks_identified: bool,
    pub provider_used: String,
    pub degraded: bool,
    pub confidence: f32,
    pub summary: Option<String>,
    /// Document-level recommendations, separate from per-finding ones.
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_span_overlap_threshold")]
    pub span_overlap_threshold: f32,
    #[serde(default)]
    pub thresholds: RiskThresholds,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            span_overlap_threshold: default_span_overlap_threshold(),
            thresholds: RiskThresholds::default(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.8
}

fn default_span_overlap_threshold() -> f32 {
    0.5
}

/// Where an accepted response came from and how far it can be trusted.
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub provider: &'a str,
    pub severity_scale: SeverityScale,
    pub confidence: f32,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    config: ExtractionConfig,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Parse and assemble a raw response in one step.
    pub fn extract(
        &self,
        raw: &RawModelOutput,
        segments: &[TextSegment],
        spec: &TaskSpec,
        severity_scale: SeverityScale,
    ) -> Result<AnalysisResult, ParseError> {
        let report = parse_report(&raw.content)?;
        let confidence = crate::orchestrator::resolve_confidence(raw, &report);
        Ok(self.assemble(
            report,
            segments,
            spec,
            Provenance {
                provider: &raw.provider,
                severity_scale,
                confidence,
                degraded: confidence < spec.confidence_threshold,
            },
        ))
    }

    /// Build the final result from an already parsed report.
    #[instrument(skip_all, fields(provider = provenance.provider))]
    pub fn assemble(
        &self,
        report: ParsedReport,
        segments: &[TextSegment],
        spec: &TaskSpec,
        provenance: Provenance<'_>,
    ) -> AnalysisResult {
        let mut findings = Vec::with_capacity(report.findings.len());
        for parsed in report.findings {
            if !spec.wants(parsed.category) {
                continue;
            }
            let source_span = locate(&parsed, segments);
            if source_span.is_none() {
                debug!(category = %parsed.category, "finding has no mappable source span");
            }
            let confidence = parsed
                .confidence
                .filter(|value| value.is_finite())
                .unwrap_or(provenance.confidence)
                .clamp(0.0, 1.0);
            findings.push(RiskFinding {
                category: parsed.category,
                severity: provenance
                    .severity_scale
                    .normalize(parsed.severity.as_ref(), provenance.provider),
                description: parsed.description,
                confidence,
                source_span,
                recommendations: parsed.recommendations,
            });
        }

        let mut findings = deduplicate(
            findings,
            self.config.similarity_threshold,
            self.config.span_overlap_threshold,
        );
        findings.sort_by(|a, b| {
            b.severity
                .total_cmp(&a.severity)
                .then_with(|| span_start(a).cmp(&span_start(b)))
                .then_with(|| a.category.cmp(&b.category))
        });

        let aggregate_score = aggregate_score(&findings);
        let thresholds = &self.config.thresholds;
        AnalysisResult {
            no_risks_identified: findings.is_empty(),
            risk_band: RiskBand::from_score_with_thresholds(aggregate_score, thresholds),
            aggregate_score,
            findings,
            provider_used: provenance.provider.to_string(),
            degraded: provenance.degraded,
            confidence: provenance.confidence.clamp(0.0, 1.0),
            summary: report.summary,
            recommendations: report.recommendations,
        }
    }
}

fn span_start(finding: &RiskFinding) -> usize {
    finding.source_span.map_or(usize::MAX, |span| span.0)
}

/// Confidence-weighted mean severity, clamped to 0–100. Falls back to a plain mean when
/// every confidence is zero.
pub fn aggregate_score(findings: &[RiskFinding]) -> f32 {
    if findings.is_empty() {
        return 0.0;
    }
    let weight: f32 = findings.iter().map(|f| f.confidence).sum();
    let weighted: f32 = findings.iter().map(|f| f.severity * f.confidence).sum();
    let score = if weight > f32::EPSILON {
        weighted / weight
    } else {
        findings.iter().map(|f| f.severity).sum::<f32>() / findings.len() as f32
    };
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Resolve a finding's reference to absolute offsets in the prepared text.
fn locate(finding: &ParsedFinding, segments: &[TextSegment]) -> Option<Span> {
    if let (Some(start), Some(end)) = (finding.start, finding.end) {
        match finding.segment {
            Some(index) => {
                let segment = segments.get(index);
                if let Some(span) = segment.and_then(|s| relative_span(s, start, end)) {
                    return Some(span);
                }
            }
            None => {
                let inside = segments
                    .iter()
                    .any(|s| s.byte_range.start <= start && end <= s.byte_range.end);
                if start < end && inside {
                    return Some((start, end));
                }
            }
        }
    }

    let needle = finding.clause_text.as_deref()?.trim();
    if needle.is_empty() {
        return None;
    }
    let preferred = finding.segment.and_then(|index| segments.get(index));
    preferred
        .into_iter()
        .chain(segments.iter())
        .find_map(|segment| find_in_segment(segment, needle))
}

fn relative_span(segment: &TextSegment, start: usize, end: usize) -> Option<Span> {
    let (text, base) = (&segment.text, segment.byte_range.start);
    let in_bounds = start < end && end <= text.len();
    if in_bounds && text.is_char_boundary(start) && text.is_char_boundary(end) {
        Some((base + start, base + end))
    } else {
        None
    }
}

fn find_in_segment(segment: &TextSegment, needle: &str) -> Option<Span> {
    let haystack = segment.text.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    haystack.find(&needle).map(|idx| {
        let start = segment.byte_range.start + idx;
        (start, start + needle.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::segment_text;
    use crate::task::AnalysisType;
    use proptest::prelude::*;

    const CONTRACT: &str = "1. Fees. Customer shall pay all invoices within 10 days.\n\n\
2. Liability. Supplier liability is unlimited for all claims.\n\n\
3. Termination. Supplier may terminate at any time without notice.";

    fn segments() -> Vec<TextSegment> {
        let segments = segment_text(CONTRACT, 70);
        assert_eq!(segments.len(), 3);
        segments
    }

    fn spec(categories: &[&str], threshold: f32) -> TaskSpec {
        TaskSpec::new(
            "contract.txt",
            AnalysisType::Comprehensive,
            categories.iter().copied(),
            threshold,
        )
        .unwrap()
    }

    fn raw(content: &str) -> RawModelOutput {
        RawModelOutput {
            provider: "primary".into(),
            content: content.into(),
            self_reported_confidence: None,
            token_usage: None,
        }
    }

    fn extract(body: &str, spec: &TaskSpec) -> Result<AnalysisResult, ParseError> {
        Extractor::default().extract(&raw(body), &segments(), spec, SeverityScale::Percent)
    }

    #[test]
    fn maps_segment_relative_offsets_to_document_offsets() {
        let segments = segments();
        let local = segments[1].text.find("unlimited").unwrap();
        let body = format!(
            r#"{{"findings":[{{"category":"liability","severity":90,
               "description":"Unlimited liability","confidence":0.9,
               "segment":1,"start":{},"end":{}}}],"confidence":0.9}}"#,
            local,
            local + "unlimited".len()
        );
        let result = extract(&body, &spec(&[], 0.5)).unwrap();
        let (start, end) = result.findings[0].source_span.unwrap();
        assert_eq!(&CONTRACT[start..end], "unlimited");
        assert!(!result.degraded);
    }

    #[test]
    fn clause_text_is_located_case_insensitively() {
        let body = r#"{"findings":[{"category":"termination","severity":"high",
            "description":"Termination without notice",
            "clause_text":"supplier may terminate AT ANY TIME"}]}"#;
        let result = extract(body, &spec(&[], 0.0)).unwrap();
        let (start, end) = result.findings[0].source_span.unwrap();
        assert_eq!(&CONTRACT[start..end], "Supplier may terminate at any time");
        assert_eq!(result.findings[0].severity, 80.0);
    }

    #[test]
    fn unmappable_span_is_kept_as_none() {
        let body = r#"{"findings":[{"category":"payment","severity":40,
            "description":"Short payment window",
            "segment":7,"start":0,"end":5,"clause_text":"not in the document"}]}"#;
        let result = extract(body, &spec(&[], 0.0)).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].source_span, None);
    }

    #[test]
    fn absolute_offsets_without_segment_are_accepted() {
        let body = r#"{"findings":[{"category":"payment","severity":40,"description":"fees",
            "start":9,"end":17}]}"#;
        let result = extract(body, &spec(&[], 0.0)).unwrap();
        assert_eq!(result.findings[0].source_span, Some((9, 17)));
    }

    #[test]
    fn filters_to_requested_categories() {
        let body = r#"{"findings":[
            {"category":"payment","severity":40,"description":"fees"},
            {"category":"liability","severity":90,"description":"uncapped"}]}"#;
        let result = extract(body, &spec(&["liability"], 0.0)).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].category, RiskCategory::Liability);
    }

    #[test]
    fn empty_findings_carry_no_risk_marker() {
        let result = extract(r#"{"findings":[],"confidence":0.95}"#, &spec(&[], 0.5)).unwrap();
        assert_eq!(result.aggregate_score, 0.0);
        assert!(result.no_risks_identified);
        assert_eq!(result.risk_band, RiskBand::Low);
    }

    #[test]
    fn aggregate_is_confidence_weighted() {
        let body = r#"{"findings":[
            {"category":"payment","severity":20,"description":"late fee","confidence":0.25},
            {"category":"liability","severity":100,"description":"uncapped","confidence":0.75}]}"#;
        let result = extract(body, &spec(&[], 0.0)).unwrap();
        assert!((result.aggregate_score - 80.0).abs() < 1e-4);
        assert_eq!(result.risk_band, RiskBand::High);
        assert_eq!(result.findings[0].category, RiskCategory::Liability);
    }

    #[test]
    fn low_confidence_marks_result_degraded() {
        let result = extract(r#"{"findings":[],"confidence":0.4}"#, &spec(&[], 0.7)).unwrap();
        assert!(result.degraded);
        assert_eq!(result.confidence, 0.4);
    }

    #[test]
    fn severity_scales_and_clamping() {
        use SeverityScale::{Decimal, Percent, Unit};
        use SeverityValue::{Label, Number};
        let normalize = |scale: SeverityScale, value: SeverityValue| {
            scale.normalize(Some(&value), "p")
        };
        assert_eq!(normalize(Decimal, Number(7.0)), 70.0);
        assert_eq!(normalize(Unit, Number(0.3)), 30.0);
        assert_eq!(normalize(Percent, Number(140.0)), 100.0);
        assert_eq!(normalize(Percent, Number(-3.0)), 0.0);
        assert_eq!(normalize(Unit, Label("Critical".into())), 95.0);
        assert_eq!(normalize(Decimal, Label("4.5".into())), 45.0);
        assert_eq!(Percent.normalize(None, "p"), MEDIUM_SEVERITY);
    }

    #[test]
    fn duplicate_findings_are_merged_before_scoring() {
        let body = r#"{"findings":[
            {"category":"liability","severity":90,"confidence":0.6,
             "description":"Unlimited liability for supplier",
             "clause_text":"Supplier liability is unlimited"},
            {"category":"liability","severity":70,"confidence":0.8,
             "description":"Supplier has unlimited liability",
             "clause_text":"liability is unlimited for all claims",
             "recommendations":["Add a cap"]}]}"#;
        let result = extract(body, &spec(&[], 0.0)).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].confidence, 0.8);
        let expected = vec!["Add a cap".to_string()];
        assert_eq!(result.findings[0].recommendations, expected);
    }

    #[test]
    fn malformed_output_is_an_error() {
        let err = extract("no json here", &spec(&[], 0.0)).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    fn finding_strategy() -> impl Strategy<Value = RiskFinding> {
        (-50.0f32..200.0, 0.0f32..=1.0).prop_map(|(severity, confidence)| RiskFinding {
            category: RiskCategory::Other,
            severity,
            description: String::new(),
            confidence,
            source_span: None,
            recommendations: Vec::new(),
        })
    }

    proptest! {
        #[test]
        fn aggregate_score_stays_within_bounds(
            findings in proptest::collection::vec(finding_strategy(), 0..20)
        ) {
            let score = aggregate_score(&findings);
            prop_assert!((0.0..=100.0).contains(&score));
        }
    }
}
