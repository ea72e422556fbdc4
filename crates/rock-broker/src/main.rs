//! rock-broker entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use rock_broker::{Broker, BrokerConfig, BrokerResult};
use rock_core::{SignalHandler, TracingConfig, init_tracing};

/// rock-broker - route requests between rock clients and workers
#[derive(Debug, Parser)]
#[command(name = "rock-broker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "ROCK_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Broker name used in logs
    #[arg(long, short)]
    name: Option<String>,

    /// Endpoint to bind (can be repeated), e.g. tcp://*:5555 or ipc:///run/rock.sock
    #[arg(long = "addr", short, action = clap::ArgAction::Append)]
    addrs: Vec<String>,

    /// Log every routed message
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(TracingConfig::daemon()) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Broker failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> BrokerResult<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::load_from(path)?,
        None => {
            let path = BrokerConfig::default_path();
            if path.exists() {
                BrokerConfig::load_from(&path)?
            } else {
                BrokerConfig::default()
            }
        }
    };

    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if !cli.addrs.is_empty() {
        config.endpoints = cli.addrs.clone();
    }
    if cli.verbose {
        config.verbose = true;
    }
    Ok(config)
}

async fn run(cli: Cli) -> BrokerResult<()> {
    let config = load_config(&cli)?;

    let signals = SignalHandler::new();
    signals.spawn_listener();

    let mut broker = Broker::new(config).with_shutdown(signals.shutdown_handle());
    broker.bind_configured().await?;
    broker.mediate().await?;

    info!("Broker stopped");
    Ok(())
}
