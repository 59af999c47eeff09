//! Provider selection and fallback.
//!
//! Candidates are tried one at a time in a fixed order derived from the provider
//! health snapshot, so identical snapshots and inputs yield identical attempt logs.

use std::{cmp::Ordering, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub mod confidence;

pub use confidence::derive_confidence;

use crate::extract::{parse_report, ParsedReport, SeverityScale};
use crate::preprocess::TextSegment;
use crate::provider::{
    CallUsage, CircuitState::Closed, ProviderEntry, ProviderError, ProviderTable, RawModelOutput,
};
use crate::task::{registry::ProcessingGuard, AttemptOutcome, AttemptRecord, TaskSpec};

/// Confidence of a response: self-reported by the adapter, then stated in the
/// payload, then derived from the text.
pub fn resolve_confidence(raw: &RawModelOutput, report: &ParsedReport) -> f32 {
    raw.self_reported_confidence
        .or(report.confidence)
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or_else(|| derive_confidence(&raw.content))
}

/// Receives the attempt log as it grows and answers cancellation checks.
pub trait AttemptObserver: Send + Sync {
    fn record_attempt(&self, record: AttemptRecord);
    fn cancel_requested(&self) -> bool;
}

impl AttemptObserver for ProcessingGuard {
    fn record_attempt(&self, record: AttemptRecord) {
        ProcessingGuard::record_attempt(self, record);
    }

    fn cancel_requested(&self) -> bool {
        ProcessingGuard::cancel_requested(self)
    }
}

/// Response chosen by the fallback loop.
#[derive(Debug, Clone)]
pub struct AcceptedOutput {
    pub raw: RawModelOutput,
    pub report: ParsedReport,
    pub confidence: f32,
    pub degraded: bool,
    pub severity_scale: SeverityScale,
}

#[derive(Debug, Clone)]
pub enum Orchestration {
    Accepted(AcceptedOutput),
    /// No candidate produced a usable response; carries the full attempt log.
    Exhausted(Vec<AttemptRecord>),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    providers: Arc<ProviderTable>,
}

impl Orchestrator {
    pub fn new(providers: Arc<ProviderTable>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    /// Providers able to serve `spec`, in the order they will be tried:
    /// healthy circuits first, then priority, cost weight and name.
    pub fn candidates(&self, spec: &TaskSpec) -> Vec<&ProviderEntry> {
        let capability = spec.analysis_type.required_capability();
        let mut candidates: Vec<_> = self
            .providers
            .entries()
            .iter()
            .filter(|entry| entry.descriptor.supports(capability))
            .map(|entry| (entry.circuit.state() != Closed, entry))
            .collect();
        candidates.sort_by(|(a_open, a), (b_open, b)| {
            a_open.cmp(b_open).then_with(|| by_preference(a, b))
        });
        candidates.into_iter().map(|(_, entry)| entry).collect()
    }

    #[instrument(name = "orchestrate", skip_all, fields(analysis_type = %spec.analysis_type))]
    pub async fn run(
        &self,
        segments: &[TextSegment],
        spec: &TaskSpec,
        observer: &dyn AttemptObserver,
    ) -> Orchestration {
        let candidates = self.candidates(spec);
        if candidates.is_empty() {
            warn!(
                capability = spec.analysis_type.required_capability(),
                "no provider offers the required capability"
            );
            return Orchestration::Exhausted(Vec::new());
        }
        // The provider a healthy system would have answered from.
        let primary = candidates
            .iter()
            .min_by(|a, b| by_preference(a, b))
            .map(|entry| entry.descriptor.name.clone());

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut best: Option<AcceptedOutput> = None;

        // Below-threshold answers keep the loop going; it ends when candidates run out.
        for entry in candidates {
            if observer.cancel_requested() {
                info!("cancellation requested; no further attempts");
                return Orchestration::Cancelled;
            }
            let name = entry.descriptor.name.as_str();

            if !entry.circuit.try_acquire().is_admitted() {
                debug!(provider = name, "circuit open; skipping provider");
                let record = AttemptRecord {
                    provider: name.to_string(),
                    outcome: AttemptOutcome::CircuitOpen,
                    latency_ms: 0,
                };
                observer.record_attempt(record.clone());
                attempts.push(record);
                continue;
            }

            let started = Instant::now();
            let response = match tokio::time::timeout(
                entry.descriptor.timeout,
                entry
                    .adapter
                    .infer(segments, spec.analysis_type, &spec.risk_categories),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            }
            .and_then(|raw| match parse_report(&raw.content) {
                Ok(report) => Ok((raw, report)),
                Err(err) => Err(ProviderError::MalformedResponse(err.to_string())),
            });
            let latency = started.elapsed();

            let outcome = match response {
                Ok((mut raw, report)) => {
                    entry.circuit.record_success();
                    let confidence = resolve_confidence(&raw, &report);
                    entry.record_usage(CallUsage {
                        latency,
                        confidence: Some(confidence),
                        tokens: raw.token_usage,
                    });
                    raw.provider = name.to_string();
                    let accepted = confidence >= spec.confidence_threshold;
                    let candidate = AcceptedOutput {
                        raw,
                        report,
                        confidence,
                        degraded: !accepted || primary.as_deref() != Some(name),
                        severity_scale: entry.descriptor.severity_scale,
                    };
                    if accepted {
                        let outcome = AttemptOutcome::Accepted { confidence };
                        observer.record_attempt(attempt(name, outcome, latency));
                        info!(
                            provider = name,
                            confidence,
                            degraded = candidate.degraded,
                            "provider output accepted"
                        );
                        return Orchestration::Accepted(candidate);
                    }
                    debug!(provider = name, confidence, "confidence below threshold");
                    if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                        best = Some(candidate);
                    }
                    AttemptOutcome::BelowThreshold { confidence }
                }
                Err(err) => {
                    entry.record_usage(CallUsage {
                        latency,
                        ..CallUsage::default()
                    });
                    warn!(provider = name, error = %err, "provider attempt failed");
                    match &err {
                        ProviderError::QuotaExceeded(_) => entry.circuit.record_quota_exceeded(),
                        err if err.counts_against_circuit() => entry.circuit.record_failure(),
                        _ => entry.circuit.record_neutral(),
                    }
                    failure_outcome(err)
                }
            };

            let record = attempt(name, outcome, latency);
            observer.record_attempt(record.clone());
            attempts.push(record);
        }

        match best {
            Some(mut output) => {
                output.degraded = true;
                info!(
                    provider = %output.raw.provider,
                    confidence = output.confidence,
                    "accepting best below-threshold output"
                );
                Orchestration::Accepted(output)
            }
            None => Orchestration::Exhausted(attempts),
        }
    }
}

fn by_preference(a: &ProviderEntry, b: &ProviderEntry) -> Ordering {
    let (a, b) = (&a.descriptor, &b.descriptor);
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.cost_weight.total_cmp(&b.cost_weight))
        .then_with(|| a.name.cmp(&b.name))
}

fn attempt(provider: &str, outcome: AttemptOutcome, latency: Duration) -> AttemptRecord {
    AttemptRecord {
        provider: provider.to_string(),
        outcome,
        latency_ms: latency.as_millis() as u64,
    }
}

fn failure_outcome(err: ProviderError) -> AttemptOutcome {
    match err {
        ProviderError::Timeout => AttemptOutcome::Timeout,
        ProviderError::Unavailable(reason) => AttemptOutcome::Unavailable { reason },
        ProviderError::QuotaExceeded(reason) => AttemptOutcome::QuotaExceeded { reason },
        ProviderError::MalformedResponse(reason) => AttemptOutcome::MalformedResponse { reason },
    }
}
