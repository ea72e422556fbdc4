//! rock-echo: demo service.
//!
//! Methods: `echo` returns its arguments, `sleep` waits `ms` milliseconds,
//! `remember`/`recall` keep notes in the store, `notify` queues a
//! background event.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info};

use rock_core::{SignalHandler, TracingConfig, init_tracing};
use rock_service::{
    Dispatcher, HandlerError, MemoryStore, Service, ServiceBuilder, ServiceConfig, ServiceResult,
    Store, TaskEmitter, TaskPool,
};

const SERVICE: &str = "echo";

/// rock-echo - demo rock service
#[derive(Debug, Parser)]
#[command(name = "rock-echo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "ROCK_ECHO_CONFIG")]
    config: Option<PathBuf>,

    /// Broker endpoint
    #[arg(long, short, env = "ROCK_BROKER")]
    broker: Option<String>,

    /// Log every message
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
            error!(error = %e, "Service failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> ServiceResult<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path)?,
        None => {
            let path = ServiceConfig::default_path(SERVICE);
            if path.exists() {
                ServiceConfig::load_from(&path)?
            } else {
                ServiceConfig::default()
            }
        }
    };

    if let Some(broker) = &cli.broker {
        config.broker = broker.clone();
    }
    if cli.verbose {
        config = config.with_verbose(true);
    }
    Ok(config)
}

fn echo_service(store: Arc<dyn Store>, events: TaskEmitter) -> Dispatcher {
    let recall_store = Arc::clone(&store);
    ServiceBuilder::new(SERVICE)
        .method("echo", &[], |args| async move {
            Ok(Value::Object(args.into_inner()))
        })
        .method("sleep", &["ms"], |args| async move {
            let ms: u64 = args.get("ms")?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })
        .method("remember", &["note"], move |args| {
            let store = Arc::clone(&store);
            async move {
                let note: String = args.get("note")?;
                let id = store.put("echo", "notes", json!({ "note": note })).await?;
                Ok(json!({ "id": id }))
            }
        })
        .method("recall", &["id"], move |args| {
            let store = Arc::clone(&recall_store);
            async move {
                let id: String = args.get("id")?;
                match store.get("echo", "notes", &id).await? {
                    Some(note) => Ok(note),
                    None => Err(HandlerError::new("NotFound", format!("no note {id:?}"))),
                }
            }
        })
        .method("notify", &["message"], move |args| {
            let events = events.clone();
            async move {
                let message: String = args.get("message")?;
                Ok(events.emit("echo:notified", json!({ "message": message })).await)
            }
        })
        .build()
}

async fn run(cli: Cli) -> ServiceResult<()> {
    let config = load_config(&cli)?;

    let signals = SignalHandler::new();
    signals.spawn_listener();

    let store = match config.open_store()? {
        Some(store) => store,
        None => Arc::new(MemoryStore::new()),
    };
    let tasks = config.start_tasks(TaskPool::builder().task("echo:notified", |data| async move {
        info!(message = %data["message"], "Notification");
        Ok(())
    }));

    let dispatcher = echo_service(Arc::clone(&store), tasks.emitter());
    Service::new(dispatcher, config)
        .with_tasks(tasks)
        .with_store(store)
        .with_shutdown(signals.shutdown_handle())
        .run()
        .await
}
