use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EngineError;
use crate::extract::AnalysisResult;

pub mod registry;

/// Opaque unique task identifier handed back to callers on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle states. `Queued -> Processing -> {Completed, Failed, Cancelled}`; a queued
/// task may also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Depth of analysis requested by the caller; selects providers by capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Quick,
    Comprehensive,
    Custom,
}

impl AnalysisType {
    /// Capability tag a provider must carry to serve this analysis type.
    pub fn required_capability(self) -> &'static str {
        match self {
            Self::Quick => "fast",
            Self::Comprehensive => "comprehensive",
            Self::Custom => "custom",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Comprehensive => "comprehensive",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "comprehensive" => Ok(Self::Comprehensive),
            "custom" => Ok(Self::Custom),
            other => Err(EngineError::invalid(format!(
                "unknown analysis type `{other}`"
            ))),
        }
    }
}

/// Risk category tags accepted on submission and attached to findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Liability,
    Indemnification,
    Termination,
    Payment,
    IntellectualProperty,
    Confidentiality,
    DataProtection,
    GoverningLaw,
    DisputeResolution,
    ForceMajeure,
    Warranty,
    Compliance,
    Other,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 13] = [
        Self::Liability,
        Self::Indemnification,
        Self::Termination,
        Self::Payment,
        Self::IntellectualProperty,
        Self::Confidentiality,
        Self::DataProtection,
        Self::GoverningLaw,
        Self::DisputeResolution,
        Self::ForceMajeure,
        Self::Warranty,
        Self::Compliance,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Liability => "liability",
            Self::Indemnification => "indemnification",
            Self::Termination => "termination",
            Self::Payment => "payment",
            Self::IntellectualProperty => "intellectual_property",
            Self::Confidentiality => "confidentiality",
            Self::DataProtection => "data_protection",
            Self::GoverningLaw => "governing_law",
            Self::DisputeResolution => "dispute_resolution",
            Self::ForceMajeure => "force_majeure",
            Self::Warranty => "warranty",
            Self::Compliance => "compliance",
            Self::Other => "other",
        }
    }

    /// Lenient mapping for labels produced by providers. Anything unrecognised is `Other`
    /// rather than an error so that no finding is lost to a labelling mismatch.
    pub fn from_provider_label(label: &str) -> Self {
        if let Ok(category) = label.parse() {
            return category;
        }
        let normalized = normalize_tag(label);
        let synonym = match normalized.as_str() {
            "indemnity" | "hold_harmless" => Some(Self::Indemnification),
            "limitation_of_liability" | "damages" | "penalty" | "penalties" => {
                Some(Self::Liability)
            }
            "ip" | "ip_assignment" | "intellectual_property_rights" => {
                Some(Self::IntellectualProperty)
            }
            "privacy" | "gdpr" | "personal_data" => Some(Self::DataProtection),
            "nda" | "non_disclosure" | "secrecy" => Some(Self::Confidentiality),
            "jurisdiction" | "choice_of_law" => Some(Self::GoverningLaw),
            "arbitration" | "disputes" => Some(Self::DisputeResolution),
            "payment_terms" | "fees" | "pricing" => Some(Self::Payment),
            "renewal" | "auto_renewal" | "breach" => Some(Self::Termination),
            "warranties" | "representations" => Some(Self::Warranty),
            "regulatory" => Some(Self::Compliance),
            _ => None,
        };
        synonym.unwrap_or(Self::Other)
    }
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_tag(s);
        let raw = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| EngineError::invalid(format!("unknown category `{raw}`")))
    }
}

fn normalize_tag(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

/// Immutable description of what a task should analyse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub document_ref: String,
    pub analysis_type: AnalysisType,
    /// Empty means every category.
    pub risk_categories: BTreeSet<RiskCategory>,
    pub confidence_threshold: f32,
}

impl TaskSpec {
    /// Validate raw submission parameters.
    pub fn new<I, S>(
        document_ref: impl Into<String>,
        analysis_type: AnalysisType,
        risk_categories: I,
        confidence_threshold: f32,
    ) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let document_ref = document_ref.into();
        if document_ref.trim().is_empty() {
            return Err(EngineError::invalid("document_ref must not be blank"));
        }
        if !confidence_threshold.is_finite() || !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(EngineError::invalid(format!(
                "confidence_threshold must be within 0.0..=1.0 (got {confidence_threshold})"
            )));
        }
        let risk_categories = risk_categories
            .into_iter()
            .map(|tag| tag.as_ref().parse::<RiskCategory>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self {
            document_ref,
            analysis_type,
            risk_categories,
            confidence_threshold,
        })
    }

    /// Whether findings in `category` were requested.
    pub fn wants(&self, category: RiskCategory) -> bool {
        self.risk_categories.is_empty() || self.risk_categories.contains(&category)
    }

    /// Stable digest of the request, used to collapse duplicate submissions.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document_ref.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.analysis_type.as_str().as_bytes());
        for category in &self.risk_categories {
            hasher.update([0u8]);
            hasher.update(category.as_str().as_bytes());
        }
        hasher.update(self.confidence_threshold.to_bits().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Result of a single provider attempt within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted { confidence: f32 },
    BelowThreshold { confidence: f32 },
    Timeout,
    Unavailable { reason: String },
    QuotaExceeded { reason: String },
    MalformedResponse { reason: String },
    /// Provider was skipped because its circuit is open; no call was issued.
    CircuitOpen,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::BelowThreshold { .. } => "below_threshold",
            Self::Timeout => "timeout",
            Self::Unavailable { .. } => "unavailable",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// Error class name for failed attempts.
    pub fn error_class(&self) -> Option<&'static str> {
        match self {
            Self::Timeout => Some("ProviderTimeout"),
            Self::Unavailable { .. } => Some("ProviderUnavailable"),
            Self::QuotaExceeded { .. } => Some("ProviderQuotaExceeded"),
            Self::MalformedResponse { .. } => Some("ProviderMalformedResponse"),
            Self::CircuitOpen => Some("CircuitOpen"),
            Self::Accepted { .. } | Self::BelowThreshold { .. } => None,
        }
    }

    /// Whether the provider was actually called.
    pub fn was_invoked(&self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

/// Terminal failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DocumentUnreadable,
    AllProvidersExhausted,
    TaskTimeout,
    /// The engine stopped before the task left the queue.
    EngineShutdown,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DocumentUnreadable => "DocumentUnreadable",
            Self::AllProvidersExhausted => "AllProvidersExhausted",
            Self::TaskTimeout => "TaskTimeout",
            Self::EngineShutdown => "EngineShutdown",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure detail attached to a `Failed` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub last_error_class: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            last_error_class: None,
            attempts: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.last_error_class = attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.outcome.error_class())
            .map(str::to_string);
        self.attempts = attempts;
        self
    }
}

/// Point-in-time copy of a task record.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempt_log: Vec<AttemptRecord>,
    pub result: Option<Arc<AnalysisResult>>,
    pub failure: Option<TaskFailure>,
    pub cancel_requested: bool,
}

impl Task {
    /// Provider calls actually issued (open-circuit skips excluded).
    pub fn attempt_count(&self) -> usize {
        self.attempt_log
            .iter()
            .filter(|attempt| attempt.outcome.was_invoked())
            .count()
    }

    pub fn degraded(&self) -> bool {
        self.result.as_ref().map_or(false, |result| result.degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_rejects_threshold_outside_unit_interval() {
        let err = TaskSpec::new("doc-1", AnalysisType::Quick, Vec::<String>::new(), 1.5)
            .expect_err("threshold > 1 should be rejected");
        assert!(matches!(err, EngineError::InvalidConfiguration(msg) if msg.contains("1.5")));

        let nan = TaskSpec::new("doc-1", AnalysisType::Quick, Vec::<String>::new(), f32::NAN);
        assert!(nan.is_err());
    }

    #[test]
    fn spec_rejects_unknown_category() {
        let tags = ["liability", "astrology"];
        let err = TaskSpec::new("doc-1", AnalysisType::Quick, tags, 0.5)
            .expect_err("unknown tag should be rejected");
        assert!(err.to_string().contains("astrology"));
    }

    #[test]
    fn spec_accepts_hyphenated_and_spaced_tags() {
        let spec = TaskSpec::new(
            "doc-1",
            AnalysisType::Comprehensive,
            ["Intellectual-Property", "governing law"],
            0.7,
        )
        .unwrap();
        assert!(spec.wants(RiskCategory::IntellectualProperty));
        assert!(spec.wants(RiskCategory::GoverningLaw));
        assert!(!spec.wants(RiskCategory::Payment));
    }

    #[test]
    fn empty_categories_mean_all() {
        let spec = TaskSpec::new("doc", AnalysisType::Quick, Vec::<String>::new(), 0.0).unwrap();
        assert!(RiskCategory::ALL.iter().all(|c| spec.wants(*c)));
    }

    #[test]
    fn fingerprint_ignores_category_order_but_not_threshold() {
        let a = TaskSpec::new("doc", AnalysisType::Quick, ["payment", "liability"], 0.7).unwrap();
        let b = TaskSpec::new("doc", AnalysisType::Quick, ["liability", "payment"], 0.7).unwrap();
        let c = TaskSpec::new("doc", AnalysisType::Quick, ["liability", "payment"], 0.8).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn provider_labels_map_leniently() {
        let label = RiskCategory::from_provider_label;
        assert_eq!(label("Indemnity"), RiskCategory::Indemnification);
        assert_eq!(label("GDPR"), RiskCategory::DataProtection);
        assert_eq!(label("liability"), RiskCategory::Liability);
        assert_eq!(label("vibes"), RiskCategory::Other);
    }

    #[test]
    fn failure_records_last_error_class() {
        let attempts = vec![
            AttemptRecord {
                provider: "a".into(),
                outcome: AttemptOutcome::Timeout,
                latency_ms: 10,
            },
            AttemptRecord {
                provider: "b".into(),
                outcome: AttemptOutcome::QuotaExceeded {
                    reason: "429".into(),
                },
                latency_ms: 3,
            },
        ];
        let failure = TaskFailure::new(FailureKind::AllProvidersExhausted, "no provider")
            .with_attempts(attempts);
        assert_eq!(
            failure.last_error_class.as_deref(),
            Some("ProviderQuotaExceeded")
        );
        assert_eq!(failure.attempts.len(), 2);
    }

    #[test]
    fn attempt_record_serializes_flat_outcome() {
        let record = AttemptRecord {
            provider: "primary".into(),
            outcome: AttemptOutcome::Accepted { confidence: 0.9 },
            latency_ms: 42,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["provider"], "primary");
        assert_eq!(value["outcome"], "accepted");
        assert_eq!(value["latency_ms"], 42);
    }
}
