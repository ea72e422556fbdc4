//! rock CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;

use rock_client::cli::{Cli, Command};
use rock_client::{Client, ClientConfig, ClientError, ClientResult, RpcProxy};
use rock_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(TracingConfig::cli(cli.debug)) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(reply) => {
            match serde_json::to_string_pretty(&reply) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{reply}"),
            }
            if reply.get("ok") == Some(&Value::Bool(false)) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<Value> {
    let config = ClientConfig::default()
        .with_timeout(Duration::from_millis(cli.timeout_ms))
        .with_retries(cli.retries)
        .with_codec(cli.codec)
        .with_verbose(cli.debug);
    let client = Client::connect(&cli.broker, config).await?;

    match cli.command {
        Command::Call {
            service,
            method,
            args,
        } => {
            let args: Value = serde_json::from_str(&args)
                .map_err(|e| ClientError::Config(format!("--args is not valid JSON: {e}")))?;
            if !args.is_object() {
                return Err(ClientError::Config("--args must be a JSON object".into()));
            }
            RpcProxy::new(client, service).call(&method, args).await
        }
        Command::Info { service } => RpcProxy::new(client, service).info().await,
    }
}
