//! Service runner: a worker agent driving a [`Dispatcher`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, interval_at};
use tracing::{Instrument, info, info_span, warn};

use rock_client::{Worker, WorkerConfig};
use rock_core::ShutdownHandle;
use rock_protocol::Endpoint;

use crate::dispatch::Dispatcher;
use crate::error::{ServiceError, ServiceResult};
use crate::store::{Store, open_store};
use crate::tasks::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS, TaskPool, TaskPoolBuilder};

/// Default broker address for services.
pub const DEFAULT_BROKER: &str = "tcp://localhost:5555";

/// Service process configuration.
///
/// ```toml
/// broker = "ipc:///run/rock/broker.sock"
/// store = "memory"
/// task_workers = 4
///
/// [worker]
/// heartbeat_interval_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Broker endpoint.
    pub broker: String,
    /// Heartbeat and reconnect settings.
    pub worker: WorkerConfig,
    /// Background task consumers.
    pub task_workers: usize,
    /// Background task queue capacity.
    pub task_queue_depth: usize,
    /// Store driver, if the service keeps documents.
    pub store: Option<String>,
    /// Log every message at info level.
    pub verbose: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            worker: WorkerConfig::default(),
            task_workers: DEFAULT_WORKERS,
            task_queue_depth: DEFAULT_QUEUE_DEPTH,
            store: None,
            verbose: false,
        }
    }
}

impl ServiceConfig {
    /// Builder: set the broker endpoint.
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    /// Builder: set worker settings.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Builder: set the store driver.
    pub fn with_store(mut self, driver: impl Into<String>) -> Self {
        self.store = Some(driver.into());
        self
    }

    /// Builder: set verbose message logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self.worker.verbose = verbose;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ServiceResult<()> {
        self.broker
            .parse::<Endpoint>()
            .map_err(|e| ServiceError::config(format!("broker: {e}")))?;
        if self.worker.heartbeat_interval_ms == 0 {
            return Err(ServiceError::config(
                "worker.heartbeat_interval_ms must be greater than zero",
            ));
        }
        if self.worker.heartbeat_liveness == 0 {
            return Err(ServiceError::config(
                "worker.heartbeat_liveness must be greater than zero",
            ));
        }
        if self.task_workers == 0 {
            return Err(ServiceError::config("task_workers must be greater than zero"));
        }
        Ok(())
    }

    /// Loads configuration from a TOML file.
    pub fn load_from(path: &Path) -> ServiceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|e| {
            ServiceError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.worker.verbose |= config.verbose;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path for a service.
    pub fn default_path(service: &str) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rock")
            .join(format!("{service}.toml"))
    }

    /// Opens the configured store, if any.
    pub fn open_store(&self) -> ServiceResult<Option<Arc<dyn Store>>> {
        self.store
            .as_deref()
            .map(open_store)
            .transpose()
            .map_err(ServiceError::from)
    }

    /// Applies the pool sizing to `builder` and starts it.
    pub fn start_tasks(&self, builder: TaskPoolBuilder) -> TaskPool {
        builder
            .workers(self.task_workers)
            .queue_depth(self.task_queue_depth)
            .start()
    }
}

/// Runs a dispatcher as a worker until shutdown.
pub struct Service {
    dispatcher: Dispatcher,
    config: ServiceConfig,
    tasks: Option<TaskPool>,
    store: Option<Arc<dyn Store>>,
    shutdown: ShutdownHandle,
}

impl Service {
    pub fn new(dispatcher: Dispatcher, config: ServiceConfig) -> Self {
        Self {
            dispatcher,
            config,
            tasks: None,
            store: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Builder: stop this pool when the service stops.
    pub fn with_tasks(mut self, tasks: TaskPool) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Builder: close this store when the service stops.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder: stop when this handle fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that stops [`Service::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Serves requests until shutdown, then releases the worker, the task
    /// pool and the store.
    ///
    /// The worker keeps heartbeating while a handler runs, so a slow call
    /// does not get the worker evicted.
    pub async fn run(self) -> ServiceResult<()> {
        let name = self.dispatcher.name().to_string();
        let span = info_span!("service", name = %name);
        let result = self.serve().instrument(span).await;
        if let Err(e) = &result {
            warn!(service = %name, error = %e, "Service stopped with error");
        }
        result
    }

    async fn serve(self) -> ServiceResult<()> {
        let Self {
            dispatcher,
            config,
            tasks,
            store,
            shutdown,
        } = self;

        let result = serve_requests(&dispatcher, &config, shutdown).await;

        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        if let Some(store) = store {
            store.close().await;
        }
        result
    }
}

async fn serve_requests(
    dispatcher: &Dispatcher,
    config: &ServiceConfig,
    shutdown: ShutdownHandle,
) -> ServiceResult<()> {
    config.validate()?;
    let interval = config.worker.heartbeat_interval();
    let mut worker = Worker::connect(&config.broker, dispatcher.name(), config.worker.clone())
        .await?
        .with_shutdown(shutdown);
    info!(
        broker = %config.broker,
        methods = ?dispatcher.methods().collect::<Vec<_>>(),
        "Service started"
    );

    let mut served: u64 = 0;
    let result: ServiceResult<()> = loop {
        let Some(body) = worker.recv().await else {
            break Ok(());
        };

        let reply = {
            let handled = dispatcher.handle(&body);
            tokio::pin!(handled);
            let mut beat = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    reply = &mut handled => break reply,
                    _ = beat.tick() => worker.heartbeat().await,
                }
            }
        };

        if let Err(e) = worker.reply(reply).await {
            break Err(ServiceError::from(e));
        }
        served += 1;
    };

    worker.close().await;
    info!(served, "Service stopped");
    result
}
