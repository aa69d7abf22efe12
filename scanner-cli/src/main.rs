//! EVM event scanner CLI.
//!
//! Loads a YAML configuration describing RPC endpoints, scan-loop
//! tuning, a log filter, and output sinks, then runs the scanner until
//! a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! scanner-cli run --config scanner.yaml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scanner_core::config::Config;
use tokio_util::sync::CancellationToken;

/// Multi-endpoint EVM event scanner.
#[derive(Debug, Parser)]
#[command(name = "scanner-cli", version, about)]
struct Cli {
    /// Path to the scanner's YAML configuration file.
    #[arg(long, default_value = "scanner.yaml", global = true)]
    config: PathBuf,

    /// Log level passed to the tracing env filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scanner until interrupted.
    Run,
    /// Validate the configuration file and exit without scanning.
    Check,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Check => {
            tracing::info!(
                nodes = config.nodes.len(),
                chain_id = config.scanner.chain_id,
                sinks = config.outputs.sinks.len(),
                "configuration is valid"
            );
            Ok(())
        }
        Command::Run => {
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                    shutdown.cancel();
                }
            });
            scanner_cli::run(config, cancel).await
        }
    }
}

/// Loads and parses the YAML configuration at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse as a
/// valid [`Config`]; a missing node list cannot be defaulted the way
/// built-in chain RPCs can, so unlike some config loaders a missing
/// file here is a fatal startup error, not a fallback to defaults.
fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}
