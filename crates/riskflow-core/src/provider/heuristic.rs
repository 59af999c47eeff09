//! Offline provider that scores documents with a keyword/regex rule pack.

use std::{cmp::Ordering, collections::BTreeSet};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument, trace};

use super::{
    rules::{Rule, RuleKind, RulePack},
    ProviderAdapter, ProviderError, RawModelOutput,
};
use crate::preprocess::TextSegment;
use crate::task::{AnalysisType, RiskCategory};

const DEFAULT_CONFIDENCE: f32 = 0.6;

pub struct HeuristicAdapter {
    name: String,
    keywords: Option<(AhoCorasick, Vec<Rule>)>,
    regexes: Vec<(Regex, Rule)>,
    confidence: f32,
}

impl HeuristicAdapter {
    pub fn new(name: impl Into<String>, pack: RulePack) -> Result<Self> {
        let keyword_rules: Vec<_> = pack
            .rules()
            .iter()
            .filter(|rule| rule.kind == RuleKind::Keyword)
            .cloned()
            .collect();
        let keywords = if keyword_rules.is_empty() {
            None
        } else {
            let automaton = AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostLongest)
                .build(keyword_rules.iter().map(|rule| rule.pattern.as_str()))
                .context("failed to build keyword automaton from rules")?;
            Some((automaton, keyword_rules))
        };

        let mut regexes = Vec::new();
        for rule in pack.rules() {
            if rule.kind != RuleKind::Regex {
                continue;
            }
            let regex = Regex::new(&rule.pattern)
                .with_context(|| format!("invalid regex pattern for rule {}", rule.id))?;
            regexes.push((regex, rule.clone()));
        }

        Ok(Self {
            name: name.into(),
            keywords,
            regexes,
            confidence: DEFAULT_CONFIDENCE,
        })
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    fn scan_segment(
        &self,
        segment: &TextSegment,
        categories: &BTreeSet<RiskCategory>,
        out: &mut Vec<Hit>,
    ) {
        let wanted = |rule: &Rule| categories.is_empty() || categories.contains(&rule.category);

        if let Some((automaton, rules)) = &self.keywords {
            for mat in automaton.find_iter(&segment.text) {
                let Some(rule) = rules.get(mat.pattern().as_usize()) else {
                    continue;
                };
                if wanted(rule) {
                    push_hit(out, segment, rule, (mat.start(), mat.end()));
                }
            }
        }
        for (regex, rule) in self.regexes.iter().filter(|(_, rule)| wanted(rule)) {
            trace!(rule_id = %rule.id, "scanning regex rule");
            for found in regex.find_iter(&segment.text) {
                push_hit(out, segment, rule, (found.start(), found.end()));
            }
        }
    }
}

struct Hit {
    rule_id: String,
    finding: WireFinding,
}

fn push_hit(out: &mut Vec<Hit>, segment: &TextSegment, rule: &Rule, span: (usize, usize)) {
    if span.0 >= span.1 {
        return;
    }
    out.push(Hit {
        rule_id: rule.id.clone(),
        finding: WireFinding {
            category: rule.category,
            severity: rule.weight,
            description: rule.description.clone(),
            segment: segment.index,
            start: span.0,
            end: span.1,
            clause_text: segment.text[span.0..span.1].to_string(),
            recommendations: rule.recommendation.iter().cloned().collect(),
        },
    });
}

#[derive(Serialize)]
struct WireReport {
    findings: Vec<WireFinding>,
    confidence: f32,
    summary: String,
}

#[derive(Serialize)]
struct WireFinding {
    category: RiskCategory,
    severity: f32,
    description: String,
    segment: usize,
    start: usize,
    end: usize,
    clause_text: String,
    recommendations: Vec<String>,
}

#[async_trait]
impl ProviderAdapter for HeuristicAdapter {
    #[instrument(name = "heuristic_infer", skip_all, fields(provider = %self.name))]
    async fn infer(
        &self,
        segments: &[TextSegment],
        _analysis_type: AnalysisType,
        risk_categories: &BTreeSet<RiskCategory>,
    ) -> Result<RawModelOutput, ProviderError> {
        let mut hits = Vec::new();
        for segment in segments {
            self.scan_segment(segment, risk_categories, &mut hits);
        }
        hits.sort_by(|a, b| {
            b.finding
                .severity
                .partial_cmp(&a.finding.severity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.finding.segment.cmp(&b.finding.segment))
                .then_with(|| a.finding.start.cmp(&b.finding.start))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        let summary = match hits.len() {
            0 => "no rule matched".to_string(),
            1 => "1 rule match".to_string(),
            n => format!("{n} rule matches"),
        };
        debug!(matches = hits.len(), "heuristic scan completed");

        let report = WireReport {
            findings: hits.into_iter().map(|hit| hit.finding).collect(),
            confidence: self.confidence,
            summary,
        };
        let content = serde_json::to_string(&report)
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;

        Ok(RawModelOutput {
            provider: self.name.clone(),
            content,
            self_reported_confidence: Some(self.confidence),
            token_usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::parse_report;
    use crate::preprocess::segment_text;

    fn adapter() -> HeuristicAdapter {
        HeuristicAdapter::new("rules", RulePack::builtin().unwrap()).unwrap()
    }

    const CONTRACT: &str = "The Supplier accepts UNLIMITED LIABILITY for all losses.\n\n\
        Either party may terminate this agreement at any time by email.\n\n\
        Invoices are payable within thirty days.";

    #[tokio::test]
    async fn finds_keyword_and_regex_rules_case_insensitively() {
        let segments = segment_text(CONTRACT, 80);
        let output = adapter()
            .infer(&segments, AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(output.self_reported_confidence, Some(DEFAULT_CONFIDENCE));

        let report = parse_report(&output.content).unwrap();
        let categories: Vec<_> = report.findings.iter().map(|f| f.category).collect();
        assert!(categories.contains(&RiskCategory::Liability));
        assert!(categories.contains(&RiskCategory::Termination));
        assert!(!categories.contains(&RiskCategory::Payment));

        let liability = &report.findings[0];
        assert_eq!(liability.category, RiskCategory::Liability);
        assert_eq!(
            liability.clause_text.as_deref(),
            Some("UNLIMITED LIABILITY")
        );
        let segment = &segments[liability.segment.unwrap()];
        assert_eq!(
            &segment.text[liability.start.unwrap()..liability.end.unwrap()],
            "UNLIMITED LIABILITY"
        );
    }

    #[tokio::test]
    async fn category_filter_limits_matches() {
        let segments = segment_text(CONTRACT, 80);
        let only_termination = BTreeSet::from([RiskCategory::Termination]);
        let output = adapter()
            .infer(&segments, AnalysisType::Quick, &only_termination)
            .await
            .unwrap();
        let report = parse_report(&output.content).unwrap();
        assert!(!report.findings.is_empty());
        assert!(report
            .findings
            .iter()
            .all(|f| f.category == RiskCategory::Termination));
    }

    #[tokio::test]
    async fn clean_text_reports_no_findings() {
        let segments = segment_text("The parties met for lunch and discussed the weather.", 200);
        let output = adapter()
            .with_confidence(0.75)
            .infer(&segments, AnalysisType::Quick, &BTreeSet::new())
            .await
            .unwrap();
        let report = parse_report(&output.content).unwrap();
        assert!(report.findings.is_empty());
        assert_eq!(report.confidence, Some(0.75));
        assert_eq!(report.summary.as_deref(), Some("no rule matched"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let patterns = concat!(
            r#"[{"id": "BROKEN", "category": "other", "description": "bad","#,
            r#" "pattern": "(", "weight": 10}]"#
        );
        std::fs::write(temp.path().join("patterns.json"), patterns).unwrap();
        let pack = RulePack::from_dir(temp.path()).unwrap();
        let err = HeuristicAdapter::new("rules", pack).err().unwrap();
        assert!(err.to_string().contains("BROKEN"));
    }
}
