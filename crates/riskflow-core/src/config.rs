//! Engine configuration.
//!
//! Loaded from an optional file (TOML, YAML or JSON by extension) layered with
//! `RISKFLOW_`-prefixed environment variables; `__` separates nested keys, e.g.
//! `RISKFLOW_CIRCUIT__FAILURE_THRESHOLD=3`. Durations are humantime strings.

use std::{collections::HashSet, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::extract::ExtractionConfig;
use crate::preprocess::SegmenterConfig;
use crate::provider::{CircuitConfig, ProviderConfig};

const ENV_PREFIX: &str = "RISKFLOW";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Collapse identical submissions onto one task.
    #[serde(default = "default_dedup")]
    pub dedup_enabled: bool,
    /// Wall-clock budget for a task, measured from the start of processing.
    #[serde(default = "default_task_deadline", with = "duration_str")]
    pub task_deadline: Duration,
    #[serde(default = "default_sweep_interval", with = "duration_str")]
    pub sweep_interval: Duration,
    /// Terminal tasks older than this are purged. `None` keeps them forever.
    #[serde(default, with = "option_duration_str")]
    pub retention: Option<Duration>,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            dedup_enabled: default_dedup(),
            task_deadline: default_task_deadline(),
            sweep_interval: default_sweep_interval(),
            retention: None,
            segmenter: SegmenterConfig::default(),
            circuit: CircuitConfig::default(),
            extraction: ExtractionConfig::default(),
            providers: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_dedup() -> bool {
    true
}

fn default_task_deadline() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

impl EngineConfig {
    /// Load from `path` (if given) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let settings = builder.build().with_context(|| match path {
            Some(path) => format!("failed to read configuration from {}", path.display()),
            None => "failed to read configuration from the environment".to_string(),
        })?;
        let config: Self = settings
            .try_deserialize()
            .context("configuration does not match the expected schema")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::invalid("workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::invalid("queue_capacity must be at least 1"));
        }
        if self.segmenter.max_segment_bytes < 64 {
            return Err(EngineError::invalid(
                "segmenter.max_segment_bytes must be at least 64",
            ));
        }
        if self.task_deadline.is_zero() || self.sweep_interval.is_zero() {
            return Err(EngineError::invalid(
                "task_deadline and sweep_interval must be non-zero",
            ));
        }
        for (field, value) in [
            ("similarity_threshold", self.extraction.similarity_threshold),
            ("span_overlap_threshold", self.extraction.span_overlap_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::invalid(format!(
                    "extraction.{field} must be within 0.0..=1.0 (got {value})"
                )));
            }
        }
        let bands = &self.extraction.thresholds;
        if !(0.0..=100.0).contains(&bands.medium) || !(bands.medium..=100.0).contains(&bands.high) {
            return Err(EngineError::invalid(
                "extraction.thresholds must satisfy 0 <= medium <= high <= 100",
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(EngineError::invalid("provider name must not be blank"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(EngineError::invalid(format!(
                    "duplicate provider name `{}`",
                    provider.name
                )));
            }
            if !provider.cost_weight.is_finite() || provider.cost_weight < 0.0 {
                return Err(EngineError::invalid(format!(
                    "provider `{}` cost_weight must be a non-negative number",
                    provider.name
                )));
            }
            if provider.timeout.is_zero() {
                return Err(EngineError::invalid(format!(
                    "provider `{}` timeout must be non-zero",
                    provider.name
                )));
            }
            if let Some(confidence) = provider.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(EngineError::invalid(format!(
                        "provider `{}` confidence must be within 0.0..=1.0",
                        provider.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Seconds(u64),
}

impl DurationRepr {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            Self::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|err| E::custom(format!("invalid duration `{text}`: {err}"))),
            Self::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// Serde adapter for `Duration` as a humantime string (`"30s"`, `"5m"`). Bare integers
/// are read as seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::DurationRepr;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        DurationRepr::deserialize(deserializer)?.into_duration()
    }
}

pub mod option_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::DurationRepr;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.collect_str(&humantime::format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<DurationRepr>::deserialize(deserializer)?
            .map(DurationRepr::into_duration)
            .transpose()
    }
}
