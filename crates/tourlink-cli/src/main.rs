//! tourlink CLI - simulated tour audio sessions

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tourlink_core::TourlinkConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tourlink_cli::{simulate, Cli, Commands, SimulationPlan};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;

    match cli.command {
        Commands::Simulate {
            tour,
            languages,
            duration_secs,
            peer_timeout_secs,
        } => {
            let plan = SimulationPlan {
                tour,
                languages,
                duration: Duration::from_secs(duration_secs),
                peer_timeout: Duration::from_secs(peer_timeout_secs),
            };
            let summary = simulate::run(config, plan)
                .await
                .context("simulation failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    info!("tourlink exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level; `RUST_LOG` takes precedence
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<TourlinkConfig> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            TourlinkConfig::load_from_file(path)
                .with_context(|| format!("loading configuration from {path}"))
        }
        None => {
            info!("Using default configuration");
            Ok(TourlinkConfig::default())
        }
    }
}
