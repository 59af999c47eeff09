use std::fmt::Write;

use serde::Serialize;

use crate::extract::AnalysisResult;
use crate::gateway::TaskStatusView;
use crate::provider::ProviderHealth;

/// Format styles supported by the renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Render a finished (or failed) task together with its result, if any.
pub fn render_report(
    status: &TaskStatusView,
    result: Option<&AnalysisResult>,
    format: OutputFormat,
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(status, result),
        OutputFormat::Json => {
            let report = JsonReport { status, result };
            Ok(serde_json::to_string_pretty(&report)?)
        }
    }
}

fn render_human(
    status: &TaskStatusView,
    result: Option<&AnalysisResult>,
) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "Task {} [{}]", status.id, status.status)?;
    writeln!(
        out,
        "Document: {} ({} analysis, {} provider call(s))",
        status.document_ref, status.analysis_type, status.attempt_count
    )?;

    if let Some(failure) = &status.failure {
        writeln!(out)?;
        writeln!(out, "Failed: {} - {}", failure.kind, failure.message)?;
        if let Some(class) = &failure.last_error_class {
            writeln!(out, "Last error: {class}")?;
        }
        if !failure.attempts.is_empty() {
            writeln!(out, "Attempts:")?;
            for attempt in &failure.attempts {
                writeln!(
                    out,
                    "  - {provider:<16} {outcome:<20} {latency} ms",
                    provider = attempt.provider,
                    outcome = attempt.outcome.label(),
                    latency = attempt.latency_ms
                )?;
            }
        }
    }

    let Some(result) = result else {
        return Ok(out);
    };

    writeln!(out)?;
    writeln!(
        out,
        "Risk Score: {:.1} ({})",
        result.aggregate_score,
        result.risk_band.as_str()
    )?;
    writeln!(
        out,
        "Provider: {} • confidence {:.2}{}",
        result.provider_used,
        result.confidence,
        if result.degraded { " • degraded" } else { "" }
    )?;
    if let Some(summary) = &result.summary {
        writeln!(out, "Summary: {}", single_line(summary))?;
    }
    writeln!(out)?;

    if result.no_risks_identified {
        writeln!(out, "No risks identified.")?;
    } else {
        writeln!(out, "Findings:")?;
        for finding in &result.findings {
            let span = finding
                .source_span
                .map(|(start, end)| format!(" @ {start}..{end}"))
                .unwrap_or_default();
            writeln!(
                out,
                "  - {category} [{severity:.0}] conf {confidence:.2}{span}",
                category = finding.category,
                severity = finding.severity,
                confidence = finding.confidence,
            )?;
            writeln!(out, "    {}", single_line(&finding.description))?;
            for recommendation in &finding.recommendations {
                writeln!(out, "    -> {}", single_line(recommendation))?;
            }
        }
    }

    if !result.recommendations.is_empty() {
        writeln!(out)?;
        writeln!(out, "Recommendations:")?;
        for recommendation in &result.recommendations {
            writeln!(out, "  - {}", single_line(recommendation))?;
        }
    }

    Ok(out)
}

/// Render the provider table with circuit state and usage.
pub fn render_providers(
    providers: &[ProviderHealth],
    format: OutputFormat,
) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(providers)?);
    }
    let mut out = String::new();
    writeln!(out, "{} provider(s) configured", providers.len())?;
    for provider in providers {
        let kind = provider
            .descriptor
            .kind
            .map(|kind| kind.as_str())
            .unwrap_or("custom");
        let capabilities: Vec<_> = provider
            .descriptor
            .capabilities
            .iter()
            .map(String::as_str)
            .collect();
        write!(
            out,
            "- {name:<16} [{kind:9}] priority {priority:>3} cost {cost:>4.1}",
            name = provider.descriptor.name,
            priority = provider.descriptor.priority,
            cost = provider.descriptor.cost_weight,
        )?;
        writeln!(
            out,
            " :: {caps} (circuit {state})",
            caps = capabilities.join(", "),
            state = provider.circuit.state.as_str(),
        )?;
    }
    Ok(out)
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    status: &'a TaskStatusView,
    result: Option<&'a AnalysisResult>,
}
