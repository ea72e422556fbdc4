//! Background task pool.
//!
//! Handlers hand work to the pool with [`TaskEmitter::emit`] and answer right
//! away. A fixed number of consumers pull events off one bounded queue and
//! run the task registered for the event name.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rock_core::ShutdownHandle;

use crate::dispatch::HandlerError;

/// Default number of consumers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

type TaskFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Debug)]
struct Event {
    name: String,
    data: Value,
}

/// Registers tasks and starts a [`TaskPool`].
pub struct TaskPoolBuilder {
    tasks: HashMap<String, TaskFn>,
    workers: usize,
    queue_depth: usize,
}

impl Default for TaskPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPoolBuilder {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Registers the task run for `event`, e.g. `"user:created"`.
    pub fn task<F, Fut>(mut self, event: &str, task: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.tasks
            .insert(event.to_string(), Arc::new(move |data| Box::pin(task(data))));
        self
    }

    /// Builder: number of consumers (at least one).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Builder: queue capacity (at least one).
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Spawns the consumers. Must be called inside a tokio runtime.
    pub fn start(self) -> TaskPool {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let tasks = Arc::new(self.tasks);
        let shutdown = ShutdownHandle::new();

        let consumers = (0..self.workers)
            .map(|id| {
                tokio::spawn(consume(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&tasks),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(workers = self.workers, events = tasks.len(), "Task pool started");
        TaskPool {
            emitter: TaskEmitter { tx },
            shutdown,
            consumers,
        }
    }
}

async fn consume(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    tasks: Arc<HashMap<String, TaskFn>>,
    shutdown: ShutdownHandle,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            event = async { rx.lock().await.recv().await } => event,
        };
        let Some(Event { name, data }) = event else {
            break;
        };

        let Some(task) = tasks.get(&name) else {
            warn!(consumer = id, event = %name, "No task registered for event");
            continue;
        };

        debug!(consumer = id, event = %name, "Running task");
        match AssertUnwindSafe(task(data)).catch_unwind().await {
            Ok(Ok(())) => debug!(consumer = id, event = %name, "Task finished"),
            Ok(Err(e)) => error!(consumer = id, event = %name, error = %e, "Task failed"),
            Err(_) => error!(consumer = id, event = %name, "Task panicked"),
        }
    }
    debug!(consumer = id, "Task consumer stopped");
}

/// Cloneable handle for queueing events.
#[derive(Clone)]
pub struct TaskEmitter {
    tx: mpsc::Sender<Event>,
}

impl TaskEmitter {
    /// Queues `event` and returns the reply handed back to the caller.
    ///
    /// Waits while the queue is full.
    pub async fn emit(&self, event: &str, data: Value) -> Value {
        let queued = Event {
            name: event.to_string(),
            data,
        };
        match self.tx.send(queued).await {
            Ok(()) => json!({
                "ok": true,
                "details": format!("{event} event emitted..."),
            }),
            Err(_) => {
                warn!(event, "Task pool stopped, event dropped");
                json!({
                    "ok": false,
                    "error": "TaskPoolClosed",
                    "detail": format!("{event} event was not queued"),
                })
            }
        }
    }
}

/// Running task pool.
pub struct TaskPool {
    emitter: TaskEmitter,
    shutdown: ShutdownHandle,
    consumers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn builder() -> TaskPoolBuilder {
        TaskPoolBuilder::new()
    }

    /// Handle for handlers to queue events.
    pub fn emitter(&self) -> TaskEmitter {
        self.emitter.clone()
    }

    /// Stops the consumers. Events still queued are dropped; running tasks
    /// finish first.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Task consumer ended abnormally");
            }
        }
        info!("Task pool stopped");
    }
}
