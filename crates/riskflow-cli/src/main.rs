use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use riskflow_core::{
    extract::SeverityScale, render_providers, render_report, AnalysisType, DocumentResolver,
    Engine, EngineConfig, FsDocumentResolver, OutputFormat, ProviderConfig, ProviderKind,
    ProviderTable, RiskBand, SubmitRequest, TaskStatus,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(
    name = "riskflow",
    author,
    version,
    about = "Document risk analysis across multiple AI providers"
)]
struct Cli {
    /// Engine configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse a document and print the risk report
    Analyze {
        /// Document to analyse (.txt, .md, .html, .docx)
        path: PathBuf,
        /// Analysis depth
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Quick)]
        analysis_type: TypeArg,
        /// Restrict findings to these risk categories (repeatable)
        #[arg(long = "category", value_name = "CATEGORY")]
        categories: Vec<String>,
        /// Minimum confidence for a non-degraded result
        #[arg(long, default_value_t = 0.5)]
        threshold: f32,
        /// Give up waiting after this long (e.g. "90s", "5m")
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
        wait: Duration,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List configured providers with capability tags and circuit state
    Providers {
        /// Emit providers as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TypeArg {
    Quick,
    Comprehensive,
    Custom,
}

impl From<TypeArg> for AnalysisType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Quick => AnalysisType::Quick,
            TypeArg::Comprehensive => AnalysisType::Comprehensive,
            TypeArg::Custom => AnalysisType::Custom,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Analyze {
            path,
            analysis_type,
            categories,
            threshold,
            wait,
            json,
        } => {
            let request = SubmitRequest::new(path.to_string_lossy(), analysis_type.into())
                .with_categories(categories)
                .with_threshold(threshold);
            analyze(config, request, wait, json).await?
        }
        Commands::Providers { json } => list_providers(&config, json)?,
    }
    Ok(())
}

/// Load configuration; without any configured provider fall back to the built-in
/// offline rule pack so the CLI works without credentials.
fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path)?;
    if config.providers.is_empty() {
        config.providers.push(offline_provider());
    }
    Ok(config)
}

fn offline_provider() -> ProviderConfig {
    ProviderConfig {
        name: "rules".into(),
        kind: ProviderKind::Heuristic,
        priority: 100,
        capabilities: ["fast", "comprehensive", "custom", "offline"]
            .into_iter()
            .map(String::from)
            .collect(),
        cost_weight: 0.0,
        timeout: Duration::from_secs(10),
        severity_scale: SeverityScale::Percent,
        endpoint: None,
        model: None,
        api_key_env: None,
        rules_dir: None,
        confidence: None,
    }
}

async fn analyze(
    config: EngineConfig,
    request: SubmitRequest,
    wait: Duration,
    json: bool,
) -> Result<()> {
    let resolver: Arc<dyn DocumentResolver> = Arc::new(FsDocumentResolver::new());
    let engine = Engine::from_config(config, resolver)?;
    let id = engine.submit(request)?;
    debug!(task = %id, "analysis submitted");

    let status = tokio::time::timeout(wait, engine.wait(id, POLL_INTERVAL))
        .await
        .map_err(|_| {
            anyhow!(
                "task {id} did not finish within {}",
                humantime::format_duration(wait)
            )
        })??;
    let result = match status.status {
        TaskStatus::Completed => Some(engine.get_result(id)?),
        _ => None,
    };
    engine.shutdown().await;

    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let rendered = render_report(&status, result.as_deref(), format)
        .context("failed to render report")?;
    print!("{rendered}");
    if !json {
        if let Some(result) = &result {
            let band = match result.risk_band {
                RiskBand::High => "HIGH RISK".red().bold(),
                RiskBand::Medium => "MEDIUM RISK".yellow().bold(),
                RiskBand::Low => "LOW RISK".green().bold(),
            };
            println!("\n{band}");
        }
    }

    match status.status {
        TaskStatus::Completed => Ok(()),
        TaskStatus::Cancelled => bail!("task {id} was cancelled"),
        _ => {
            let reason = status
                .failure
                .map(|failure| format!("{}: {}", failure.kind, failure.message))
                .unwrap_or_else(|| "unknown failure".into());
            bail!("task {id} failed ({reason})")
        }
    }
}

fn list_providers(config: &EngineConfig, json: bool) -> Result<()> {
    let table = ProviderTable::from_config(&config.providers, &config.circuit)
        .context("failed to initialise providers")?;
    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    print!("{}", render_providers(&table.health(), format)?);
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
