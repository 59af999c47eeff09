//! Lenient parsing of provider output into candidate findings.
//!
//! Models wrap JSON in code fences, chat around it, leave raw newlines inside strings
//! or stop mid-object. Parsing tries strict JSON first, then a sanitised copy, then
//! JSON5, before giving up with [`ParseError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::RiskCategory;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("provider returned no content")]
    Empty,
    #[error("provider output is not JSON: {0}")]
    InvalidJson(String),
    #[error("provider output does not match the findings schema: {0}")]
    Schema(String),
}

/// Severity as emitted by a provider, before scale normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeverityValue {
    Number(f64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFinding {
    pub category: RiskCategory,
    pub severity: Option<SeverityValue>,
    pub description: String,
    pub confidence: Option<f32>,
    pub segment: Option<usize>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub clause_text: Option<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedReport {
    pub findings: Vec<ParsedFinding>,
    pub confidence: Option<f32>,
    pub summary: Option<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireReport {
    #[serde(default, alias = "risky_clauses")]
    findings: Option<Vec<WireFinding>>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default, alias = "analysis_summary")]
    summary: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireFinding {
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "risk_level")]
    severity: Option<SeverityValue>,
    #[serde(default, alias = "risk_explanation")]
    description: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    segment: Option<usize>,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    end: Option<usize>,
    #[serde(default)]
    clause_text: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    legal_concerns: Vec<String>,
    #[serde(default)]
    business_impact: Option<String>,
}

impl WireFinding {
    fn into_parsed(self) -> ParsedFinding {
        let category = match self.category.as_deref() {
            Some(label) => RiskCategory::from_provider_label(label),
            None => self
                .legal_concerns
                .iter()
                .map(|concern| RiskCategory::from_provider_label(concern))
                .find(|category| *category != RiskCategory::Other)
                .unwrap_or(RiskCategory::Other),
        };

        let mut description = self
            .description
            .filter(|text| !text.trim().is_empty())
            .or_else(|| self.business_impact.clone())
            .or_else(|| self.clause_text.clone())
            .unwrap_or_else(|| "unspecified risk".to_string())
            .trim()
            .to_string();
        if !self.legal_concerns.is_empty() {
            description.push_str(&format!(" (concerns: {})", self.legal_concerns.join("; ")));
        }

        ParsedFinding {
            category,
            severity: self.severity,
            description,
            confidence: self.confidence,
            segment: self.segment,
            start: self.start,
            end: self.end,
            clause_text: self.clause_text.filter(|text| !text.trim().is_empty()),
            recommendations: self
                .recommendations
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

/// Parse raw provider content into a report.
pub fn parse_report(content: &str) -> Result<ParsedReport, ParseError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    let payload = extract_json_payload(trimmed);
    let value = parse_value(&payload)?;
    if !value.is_object() {
        return Err(ParseError::Schema(
            "top-level value must be an object".into(),
        ));
    }
    let wire: WireReport =
        serde_json::from_value(value).map_err(|err| ParseError::Schema(err.to_string()))?;
    let findings = wire.findings.ok_or_else(|| {
        ParseError::Schema("expected a `findings` (or `risky_clauses`) array".into())
    })?;
    Ok(ParsedReport {
        findings: findings.into_iter().map(WireFinding::into_parsed).collect(),
        confidence: wire.confidence.filter(|value| value.is_finite()),
        summary: wire.summary.filter(|text| !text.trim().is_empty()),
        recommendations: wire.recommendations,
    })
}

fn parse_value(payload: &str) -> Result<Value, ParseError> {
    let first_err = match serde_json::from_str::<Value>(payload) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let sanitized = sanitize_json_strings(payload);
    if sanitized != payload {
        if let Ok(value) = serde_json::from_str::<Value>(&sanitized) {
            return Ok(value);
        }
    }
    json5::from_str::<Value>(&sanitized).map_err(|_| ParseError::InvalidJson(first_err.to_string()))
}

pub(crate) fn extract_json_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = strip_code_fence(trimmed) {
        return stripped;
    }
    if !trimmed.starts_with('{') {
        if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
            if start < end {
                return trimmed[start..=end].to_string();
            }
        }
    }
    trimmed.to_string()
}

fn strip_code_fence(input: &str) -> Option<String> {
    let start = input.find("```")?;
    let mut body = &input[start + 3..];
    body = body.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    let end = body.rfind("```").unwrap_or(body.len());
    Some(body[..end].trim().to_string())
}

/// Escape raw newlines inside strings and close whatever the model left open.
fn sanitize_json_strings(payload: &str) -> String {
    let mut result = String::with_capacity(payload.len());
    let mut in_string = false;
    let mut escape = false;
    let mut closers: Vec<char> = Vec::new();

    for ch in payload.chars() {
        if in_string {
            if escape {
                result.push(ch);
                escape = false;
                continue;
            }
            match ch {
                '\\' => {
                    result.push(ch);
                    escape = true;
                }
                '"' => {
                    result.push(ch);
                    in_string = false;
                }
                '\n' => result.push_str("\\n"),
                '\r' => {}
                '\t' => result.push_str("\\t"),
                _ => result.push(ch),
            }
            continue;
        }
        result.push(ch);
        match ch {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    if in_string {
        result.push('"');
    }
    while let Some(closer) = closers.pop() {
        result.push(closer);
    }
    result
}
