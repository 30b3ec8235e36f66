//! Command-line entry point: run one workflow for an event, or check configuration.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quota_orchestrator::config::event_data_store_id;
use quota_orchestrator::{
    CreateAccountStatusResolver, Orchestrator, OrchestratorConfig, RawEvent, ReqwestQueryClient,
    WebhookNotifier,
};

#[derive(Parser)]
#[command(name = "quota-orchestrator", version, about = "Raise and track service-quota increases for member accounts")]
struct Cli {
    /// JSON configuration file; environment variables are used when omitted
    #[arg(long, global = true, env = "QUOTA_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one workflow for an account-lifecycle event
    Run {
        /// Event file, or `-` for stdin
        #[arg(long)]
        event: String,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_json_file(path)?,
        None => OrchestratorConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn read_event(source: &str) -> Result<RawEvent> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read event from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read event file {}", source))?
    };
    serde_json::from_str(&raw).context("Event is not valid JSON")
}

async fn run(config: OrchestratorConfig, event: RawEvent) -> Result<()> {
    let client = ReqwestQueryClient::new(config.backend.clone())?;
    let notifier = WebhookNotifier::new(config.notifier.clone())?;
    let resolver = CreateAccountStatusResolver::new(client.clone());

    let orchestrator = Orchestrator::new(client, notifier, resolver, config);
    let report = orchestrator.run(&event).await?;

    println!("{}", report.render_text());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let result: Result<()> = async move {
        let config = load_config(cli.config.as_deref())?;
        match cli.command {
            Commands::Run { event } => {
                let event = read_event(&event)?;
                run(config, event).await
            }
            Commands::CheckConfig => {
                let store = event_data_store_id(&config.backend.event_data_store_arn)?;
                println!(
                    "Configuration OK: event data store {}, {} quota targets",
                    store,
                    config.quotas.len()
                );
                Ok(())
            }
        }
    }
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "quota-orchestrator failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
