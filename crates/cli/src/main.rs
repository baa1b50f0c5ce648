//! Conductor CLI
//!
//! Runs coordination requests through the phased pipeline and prints the
//! outcome as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor_core::config::CoordinatorConfig;
use conductor_core::models::{capability, Capability, CoordinationLevel, Participant, Request};
use conductor_core::swarm::Coordinator;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Clone)]
#[command(author, version, about = "Conductor - Phased Coordination Pipeline")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Execute a JSON array of requests as a batch
    Run {
        /// Path to the requests file
        requests: PathBuf,
        /// Coordinator config file (JSON); defaults are used when absent
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a synthetic request
    Demo {
        /// Number of synthetic participants
        #[arg(short, long, default_value = "4")]
        participants: usize,
        /// Coordination level (basic, advanced, maximum)
        #[arg(short, long, default_value = "advanced")]
        level: CoordinationLevel,
        /// Target threshold for the final depth
        #[arg(short, long, default_value = "0.8")]
        threshold: f64,
    },
}

#[derive(Serialize)]
struct RunReport<'a, B: Serialize, S: Serialize> {
    batch: &'a B,
    status: &'a S,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("conductor=debug,conductor_core=debug")
        } else {
            EnvFilter::new("conductor=info,conductor_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Load the coordinator config, falling back to defaults when no file is given
async fn load_config(path: Option<&Path>) -> Result<CoordinatorConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match std::env::var("CONDUCTOR_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => return Ok(CoordinatorConfig::default()),
        },
    };
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Cancel the token on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

fn synthetic_request(count: usize, level: CoordinationLevel, threshold: f64) -> Request {
    let domains = capability::domains();
    let participants = (0..count)
        .map(|i| {
            let domain = domains[i % domains.len()];
            let names = capability::known(domain);
            let spread = if count > 1 {
                i as f64 / (count - 1) as f64
            } else {
                0.5
            };
            let mut participant = Participant::new(format!("participant-{}", i + 1), 0.3 + 0.5 * spread);
            if let Some(name) = names.get(i % names.len().max(1)) {
                participant = participant.with_capability(Capability::new(domain, *name));
            }
            participant
        })
        .collect();
    Request::new(participants, level, threshold)
}

async fn run_batch(requests: &Path, config: Option<&Path>) -> Result<()> {
    let config = load_config(config).await?;
    let content = tokio::fs::read_to_string(requests)
        .await
        .with_context(|| format!("reading requests {}", requests.display()))?;
    let requests: Vec<Request> = serde_json::from_str(&content)
        .with_context(|| format!("parsing requests {}", requests.display()))?;

    let coordinator = Coordinator::new(config)?;
    let batch = coordinator.execute_batch(requests).await;
    let status = coordinator.get_status();

    println!(
        "{}",
        serde_json::to_string_pretty(&RunReport {
            batch: &batch,
            status: &status,
        })?
    );
    Ok(())
}

async fn run_demo(participants: usize, level: CoordinationLevel, threshold: f64) -> Result<()> {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default())?);
    let request = synthetic_request(participants, level, threshold);

    let token = CancellationToken::new();
    cancel_on_interrupt(token.clone());

    let result = coordinator
        .execute_with_cancellation(request, &token)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        CliCommand::Run { requests, config } => run_batch(&requests, config.as_deref()).await,
        CliCommand::Demo {
            participants,
            level,
            threshold,
        } => run_demo(participants, level, threshold).await,
    }
}
