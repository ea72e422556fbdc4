//! Shutdown signalling.
//!
//! Every long-running component (broker loop, worker agent, task pool
//! consumers) checks a [`ShutdownHandle`] once per loop iteration instead of
//! relying on an in-band sentinel message. A [`SignalHandler`] wires
//! SIGTERM/SIGINT (Ctrl+C elsewhere) into the same handle.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

/// Listens for OS signals and flips the shared shutdown flag.
pub struct SignalHandler {
    handle: ShutdownHandle,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    /// Creates a handler with a fresh shutdown flag.
    pub fn new() -> Self {
        Self {
            handle: ShutdownHandle::new(),
        }
    }

    /// Spawns the signal listener task. Call once at process startup.
    #[cfg(unix)]
    pub fn spawn_listener(&self) {
        let handle = self.handle.clone();

        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
            }
            handle.trigger();

            debug!("Signal listener stopped");
        });
    }

    /// Spawns the Ctrl+C listener task.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) {
        let handle = self.handle.clone();

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, initiating shutdown");
                handle.trigger();
            }
        });
    }

    /// Returns a handle sharing this handler's shutdown flag.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Returns true once a shutdown was signalled.
    pub fn is_shutdown(&self) -> bool {
        self.handle.is_shutdown()
    }
}

/// A future-producing view of the shutdown flag.
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Completes once shutdown is triggered or every handle is gone.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Cloneable cancellation token shared between components.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl ShutdownHandle {
    /// Creates an untriggered handle not tied to any OS signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Triggers shutdown for every clone of this handle.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns true if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns a signal that completes when shutdown is triggered.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }

    /// Waits for shutdown.
    pub async fn cancelled(&self) {
        self.signal().wait().await;
    }
}
