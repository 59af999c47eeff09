//! Provider adapters and the process-wide provider table.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anthropic;
pub mod circuit;
pub mod heuristic;
pub mod openai;
pub mod prompt;
pub mod rules;
pub mod settings;

pub use circuit::{Admission, CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use settings::AdapterSettings;

use crate::error::EngineError;
use crate::extract::SeverityScale;
use crate::preprocess::TextSegment;
use crate::task::{AnalysisType, RiskCategory};

/// Failure of a single adapter call. Adapters never retry; fallback is the
/// orchestrator's job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("provider returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether the failure counts against the provider's circuit breaker.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Unparsed provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawModelOutput {
    pub provider: String,
    pub content: String,
    pub self_reported_confidence: Option<f32>,
    pub token_usage: Option<TokenUsage>,
}

/// Uniform interface to one inference backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn infer(
        &self,
        segments: &[TextSegment],
        analysis_type: AnalysisType,
        risk_categories: &BTreeSet<RiskCategory>,
    ) -> Result<RawModelOutput, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Heuristic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Heuristic => "heuristic",
        }
    }

    fn default_capabilities(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi | Self::Anthropic => &["comprehensive", "fast", "custom"],
            Self::Heuristic => &["fast", "offline"],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `providers` configuration list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub priority: u32,
    /// Defaults per kind when empty.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f32,
    #[serde(default = "default_timeout", with = "crate::config::duration_str")]
    pub timeout: Duration,
    #[serde(default)]
    pub severity_scale: SeverityScale,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
    /// Confidence reported by the heuristic adapter.
    #[serde(default)]
    pub confidence: Option<f32>,
}

fn default_cost_weight() -> f32 {
    1.0
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ProviderConfig {
    pub fn descriptor(&self) -> ProviderDescriptor {
        let capabilities = if self.capabilities.is_empty() {
            self.kind
                .default_capabilities()
                .iter()
                .map(|tag| tag.to_string())
                .collect()
        } else {
            self.capabilities
                .iter()
                .map(|tag| tag.trim().to_ascii_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect()
        };
        ProviderDescriptor {
            name: self.name.clone(),
            kind: Some(self.kind),
            priority: self.priority,
            capabilities,
            cost_weight: self.cost_weight,
            timeout: self.timeout,
            severity_scale: self.severity_scale,
        }
    }

    /// Construct the concrete adapter for this entry.
    pub fn build_adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        let adapter: Arc<dyn ProviderAdapter> = match self.kind {
            ProviderKind::OpenAi => {
                let settings = AdapterSettings::resolve(self)?;
                Arc::new(openai::OpenAiAdapter::new(&self.name, &settings)?)
            }
            ProviderKind::Anthropic => {
                let settings = AdapterSettings::resolve(self)?;
                Arc::new(anthropic::AnthropicAdapter::new(&self.name, &settings)?)
            }
            ProviderKind::Heuristic => {
                let pack = match &self.rules_dir {
                    Some(dir) => rules::RulePack::from_dir(dir)?,
                    None => rules::RulePack::builtin()?,
                };
                let mut adapter = heuristic::HeuristicAdapter::new(&self.name, pack)?;
                if let Some(confidence) = self.confidence {
                    adapter = adapter.with_confidence(confidence);
                }
                Arc::new(adapter)
            }
        };
        Ok(adapter)
    }
}

/// Static routing attributes of a registered provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: Option<ProviderKind>,
    pub priority: u32,
    pub capabilities: BTreeSet<String>,
    pub cost_weight: f32,
    #[serde(with = "crate::config::duration_str")]
    pub timeout: Duration,
    pub severity_scale: SeverityScale,
}

impl ProviderDescriptor {
    pub fn new<I, S>(name: impl Into<String>, priority: u32, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: None,
            priority,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            cost_weight: default_cost_weight(),
            timeout: default_timeout(),
            severity_scale: SeverityScale::default(),
        }
    }

    pub fn with_cost_weight(mut self, cost_weight: f32) -> Self {
        self.cost_weight = cost_weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_severity_scale(mut self, scale: SeverityScale) -> Self {
        self.severity_scale = scale;
        self
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Running usage counters for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_confidence: f32,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    /// `cost_weight` units per thousand tokens.
    pub estimated_cost: f64,
}

impl UsageStats {
    fn record(&mut self, call: &CallUsage, cost_weight: f32) {
        let CallUsage {
            latency,
            confidence,
            tokens,
        } = *call;
        if let Some(tokens) = tokens {
            self.total_tokens += tokens.total();
            self.estimated_cost += tokens.total() as f64 / 1000.0 * f64::from(cost_weight);
        }
        self.requests += 1;
        self.avg_latency_ms +=
            (latency.as_secs_f64() * 1000.0 - self.avg_latency_ms) / self.requests as f64;
        match confidence {
            Some(confidence) => {
                self.successes += 1;
                self.avg_confidence += (confidence - self.avg_confidence) / self.successes as f32;
            }
            None => self.failures += 1,
        }
    }
}

/// What one adapter call cost; `confidence` is `None` for failures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallUsage {
    pub latency: Duration,
    pub confidence: Option<f32>,
    pub tokens: Option<TokenUsage>,
}

/// Health view of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub circuit: CircuitSnapshot,
    pub usage: UsageStats,
}

pub struct ProviderEntry {
    pub descriptor: ProviderDescriptor,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub circuit: CircuitBreaker,
    usage: Mutex<UsageStats>,
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("descriptor", &self.descriptor)
            .field("circuit", &self.circuit.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    pub fn record_usage(&self, call: CallUsage) {
        let cost_weight = self.descriptor.cost_weight;
        self.usage.lock().record(&call, cost_weight);
    }

    pub fn usage(&self) -> UsageStats {
        *self.usage.lock()
    }

    pub fn health(&self) -> ProviderHealth {
        ProviderHealth {
            descriptor: self.descriptor.clone(),
            circuit: self.circuit.snapshot(),
            usage: self.usage(),
        }
    }
}

/// Arena of registered providers, indexed by name. Fixed after startup; only the
/// circuit breakers and usage counters change afterwards.
#[derive(Debug, Default)]
pub struct ProviderTable {
    entries: Vec<ProviderEntry>,
    index: HashMap<String, usize>,
}

impl ProviderTable {
    pub fn new<I>(providers: I, circuit: &CircuitConfig) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (ProviderDescriptor, Arc<dyn ProviderAdapter>)>,
    {
        let mut table = Self::default();
        for (descriptor, adapter) in providers {
            if descriptor.name.trim().is_empty() {
                return Err(EngineError::invalid("provider name must not be blank"));
            }
            if table.index.contains_key(&descriptor.name) {
                return Err(EngineError::invalid(format!(
                    "duplicate provider name `{}`",
                    descriptor.name
                )));
            }
            let position = table.entries.len();
            table.index.insert(descriptor.name.clone(), position);
            table.entries.push(ProviderEntry {
                circuit: CircuitBreaker::new(descriptor.name.clone(), circuit),
                descriptor,
                adapter,
                usage: Mutex::new(UsageStats::default()),
            });
        }
        Ok(table)
    }

    /// Build adapters for every configured provider.
    pub fn from_config(providers: &[ProviderConfig], circuit: &CircuitConfig) -> Result<Self> {
        let mut built = Vec::with_capacity(providers.len());
        for config in providers {
            let name = &config.name;
            let adapter = config
                .build_adapter()
                .with_context(|| format!("failed to initialise provider `{name}`"))?;
            built.push((config.descriptor(), adapter));
        }
        Ok(Self::new(built, circuit)?)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.entries.iter().map(ProviderEntry::health).collect()
    }
}

/// Map a non-success HTTP status onto the adapter error taxonomy.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let detail = format!("{status}: {}", truncate(body.trim(), 300));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::QuotaExceeded(detail)
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(detail)
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl ProviderAdapter for Silent {
        async fn infer(
            &self,
            _segments: &[TextSegment],
            _analysis_type: AnalysisType,
            _risk_categories: &BTreeSet<RiskCategory>,
        ) -> Result<RawModelOutput, ProviderError> {
            Err(ProviderError::Unavailable("silent".into()))
        }
    }

    fn silent() -> Arc<dyn ProviderAdapter> {
        Arc::new(Silent)
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = ProviderTable::new(
            vec![
                (ProviderDescriptor::new("a", 0, ["fast"]), silent()),
                (ProviderDescriptor::new("a", 1, ["fast"]), silent()),
            ],
            &CircuitConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate provider name `a`"));
    }

    #[test]
    fn lookup_by_name() {
        let table = ProviderTable::new(
            vec![
                (ProviderDescriptor::new("a", 0, ["fast"]), silent()),
                (ProviderDescriptor::new("b", 1, ["comprehensive"]), silent()),
            ],
            &CircuitConfig::default(),
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.get("b").unwrap().descriptor.supports("comprehensive"));
        assert!(table.get("c").is_none());
    }

    #[test]
    fn usage_stats_keep_running_averages() {
        let call = |millis, confidence| CallUsage {
            latency: Duration::from_millis(millis),
            confidence,
            tokens: None,
        };
        let mut stats = UsageStats::default();
        stats.record(&call(100, Some(0.5)), 1.0);
        stats.record(&call(300, Some(0.9)), 1.0);
        stats.record(&call(200, None), 1.0);
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert!((stats.avg_confidence - 0.7).abs() < 1e-6);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-6);
        assert_eq!(stats.total_tokens, 0);
        assert_eq!(stats.estimated_cost, 0.0);
    }

    #[test]
    fn token_usage_accumulates_weighted_cost() {
        let table = ProviderTable::new(
            vec![(
                ProviderDescriptor::new("metered", 0, ["fast"]).with_cost_weight(2.0),
                silent(),
            )],
            &CircuitConfig::default(),
        )
        .unwrap();
        let entry = table.get("metered").unwrap();
        entry.record_usage(CallUsage {
            latency: Duration::from_millis(40),
            confidence: Some(0.8),
            tokens: Some(TokenUsage {
                input_tokens: 1200,
                output_tokens: 300,
            }),
        });
        entry.record_usage(CallUsage {
            latency: Duration::from_millis(60),
            confidence: None,
            tokens: Some(TokenUsage {
                input_tokens: 500,
                output_tokens: 0,
            }),
        });

        let usage = entry.health().usage;
        assert_eq!(usage.requests, 2);
        assert_eq!(usage.total_tokens, 2000);
        assert!((usage.estimated_cost - 4.0).abs() < 1e-9);
        let json = serde_json::to_value(entry.health()).unwrap();
        assert_eq!(json["usage"]["total_tokens"], 2000);
    }

    #[test]
    fn config_defaults_capabilities_per_kind() {
        let raw = serde_json::json!({"name": "rules", "kind": "heuristic"});
        let config: ProviderConfig = serde_json::from_value(raw).unwrap();
        let descriptor = config.descriptor();
        assert!(descriptor.supports("fast"));
        assert!(descriptor.supports("offline"));
        assert!(!descriptor.supports("comprehensive"));
        assert_eq!(descriptor.timeout, Duration::from_secs(30));
    }

    #[test]
    fn http_statuses_map_to_error_classes() {
        use reqwest::StatusCode;
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "rate limited"),
            ProviderError::QuotaExceeded(msg) if msg.contains("rate limited")
        ));
        let timeout = status_error(StatusCode::GATEWAY_TIMEOUT, "");
        assert_eq!(timeout, ProviderError::Timeout);
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "down"),
            ProviderError::Unavailable(_)
        ));
        let unauthorized = status_error(StatusCode::UNAUTHORIZED, "bad key");
        assert!(unauthorized.counts_against_circuit());
        let malformed = ProviderError::MalformedResponse("x".into());
        assert!(!malformed.counts_against_circuit());
    }

    #[test]
    fn builtin_heuristic_adapter_builds() {
        let raw = serde_json::json!({"name": "rules", "kind": "heuristic"});
        let config: ProviderConfig = serde_json::from_value(raw).unwrap();
        let table = ProviderTable::from_config(&[config], &CircuitConfig::default()).unwrap();
        assert_eq!(table.health()[0].circuit.state, CircuitState::Closed);
    }
}
