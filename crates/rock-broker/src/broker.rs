//! The broker: binds endpoints and runs the routing loop.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use rock_core::ShutdownHandle;
use rock_protocol::{ClientMessage, Endpoint, PeerKind, WorkerMessage, classify, dump};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{Outbound, ServiceRegistry, display_identity};
use crate::socket::{RouterEvent, RouterSocket};

/// How long queued DISCONNECTs may take to flush on shutdown.
const SHUTDOWN_LINGER: Duration = Duration::from_millis(500);

/// Broker occupancy, published after every routing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub services: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub pending_requests: usize,
    pub peers: usize,
}

/// Majordomo broker.
///
/// ```rust,no_run
/// use rock_broker::{Broker, BrokerConfig};
///
/// # async fn run() -> rock_broker::BrokerResult<()> {
/// let mut broker = Broker::new(BrokerConfig::default());
/// broker.bind("tcp://*:5555").await?;
/// broker.mediate().await
/// # }
/// ```
pub struct Broker {
    config: BrokerConfig,
    socket: RouterSocket,
    registry: ServiceRegistry,
    shutdown: ShutdownHandle,
    stats_tx: watch::Sender<BrokerStats>,
}

impl Broker {
    /// Creates an unbound broker.
    pub fn new(config: BrokerConfig) -> Self {
        let socket = RouterSocket::new(config.peer_queue_depth, config.cleanup_stale_socket);
        let registry = ServiceRegistry::new(config.liveness_window());
        let (stats_tx, _) = watch::channel(BrokerStats::default());
        Self {
            config,
            socket,
            registry,
            shutdown: ShutdownHandle::new(),
            stats_tx,
        }
    }

    /// Builder: stop `mediate` when this handle fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Returns the broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns a handle that stops `mediate`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Binds one endpoint. May be called more than once.
    pub async fn bind(&mut self, address: &str) -> BrokerResult<Endpoint> {
        let endpoint: Endpoint = address.parse()?;
        let bound = self.socket.bind(&endpoint).await?;
        info!(broker = %self.config.name, endpoint = %bound, "Broker is active");
        Ok(bound)
    }

    /// Binds every endpoint in the configuration.
    pub async fn bind_configured(&mut self) -> BrokerResult<Vec<Endpoint>> {
        if self.config.endpoints.is_empty() {
            return Err(BrokerError::config("no endpoints configured"));
        }
        let mut bound = Vec::with_capacity(self.config.endpoints.len());
        for address in self.config.endpoints.clone() {
            bound.push(self.bind(&address).await?);
        }
        Ok(bound)
    }

    /// Endpoints currently bound.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.socket.endpoints()
    }

    /// Current occupancy.
    pub fn stats(&self) -> BrokerStats {
        let registry = self.registry.stats();
        BrokerStats {
            services: registry.services,
            idle_workers: registry.idle_workers,
            busy_workers: registry.busy_workers,
            pending_requests: registry.pending_requests,
            peers: self.socket.peer_count(),
        }
    }

    /// Watches occupancy while `mediate` runs.
    pub fn subscribe_stats(&self) -> watch::Receiver<BrokerStats> {
        self.stats_tx.subscribe()
    }

    /// Routes messages until the shutdown handle fires.
    ///
    /// On return every registered worker has been sent DISCONNECT.
    ///
    /// # Errors
    ///
    /// Fails before routing anything if the configuration is invalid or no
    /// endpoint is bound.
    pub async fn mediate(&mut self) -> BrokerResult<()> {
        self.config.validate()?;
        if !self.socket.is_bound() {
            return Err(BrokerError::NotBound);
        }
        let span = info_span!("broker", name = %self.config.name);
        self.run().instrument(span).await;
        Ok(())
    }

    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            endpoints = ?self.socket.endpoints().iter().map(ToString::to_string).collect::<Vec<_>>(),
            heartbeat_ms = self.config.heartbeat_interval_ms,
            liveness = self.config.heartbeat_liveness,
            "Broker mediating"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                event = self.socket.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
            self.publish_stats();
        }

        let farewells = self.registry.drain();
        info!(workers = farewells.len(), "Disconnecting workers");
        self.deliver(farewells);
        self.socket.close(SHUTDOWN_LINGER).await;
        self.publish_stats();
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Message { identity, frames } => {
                self.trace("I", &identity, &frames);
                let now = Instant::now();

                match classify(&frames) {
                    Ok(PeerKind::Client) => match ClientMessage::parse(frames) {
                        Ok(message) => {
                            let out = self.registry.on_client_request(identity, message, now);
                            self.deliver(out);
                        }
                        Err(e) => warn!(
                            peer = %display_identity(&identity),
                            error = %e,
                            "Dropping invalid client message"
                        ),
                    },
                    Ok(PeerKind::Worker) => match WorkerMessage::parse(frames) {
                        Ok(message) => {
                            let out = self.registry.on_worker_message(identity, message, now);
                            self.deliver(out);
                        }
                        Err(e) => warn!(
                            peer = %display_identity(&identity),
                            error = %e,
                            "Dropping invalid worker message"
                        ),
                    },
                    Err(e) => warn!(
                        peer = %display_identity(&identity),
                        error = %e,
                        "Dropping message with unknown signature"
                    ),
                }
            }
            RouterEvent::Disconnected(identity) => self.registry.peer_gone(&identity),
        }
    }

    fn tick(&mut self) {
        let purged = self.registry.purge(Instant::now());
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged expired workers");
        }
        let heartbeats = self.registry.heartbeats();
        self.deliver(heartbeats);
    }

    fn deliver(&mut self, out: impl IntoIterator<Item = Outbound>) {
        for Outbound { to, frames } in out {
            self.trace("O", &to, &frames);
            self.socket.send(&to, frames);
        }
    }

    fn trace(&self, direction: &str, peer: &[u8], frames: &[Bytes]) {
        if self.config.verbose {
            info!(peer = %display_identity(peer), "{direction}: {}", dump(frames));
        } else {
            debug!(peer = %display_identity(peer), "{direction}: {}", dump(frames));
        }
    }

    fn publish_stats(&self) {
        let current = self.stats();
        self.stats_tx.send_if_modified(|stats| {
            if *stats == current {
                false
            } else {
                *stats = current;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mediate_requires_bind() {
        let mut broker = Broker::new(BrokerConfig::default());
        assert!(matches!(broker.mediate().await, Err(BrokerError::NotBound)));
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let mut broker = Broker::new(BrokerConfig::default());
        let result = broker.bind("udp://localhost:1").await;
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }

    #[tokio::test]
    async fn bind_reports_resolved_port() {
        let mut broker = Broker::new(BrokerConfig::default());
        let endpoint = broker.bind("tcp://127.0.0.1:0").await.unwrap();
        let Endpoint::Tcp { port, .. } = endpoint else {
            panic!("expected tcp endpoint");
        };
        assert_ne!(port, 0);
        assert_eq!(broker.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_mediate() {
        let shutdown = ShutdownHandle::new();
        let mut broker =
            Broker::new(BrokerConfig::default()).with_shutdown(shutdown.clone());
        broker.bind("tcp://127.0.0.1:0").await.unwrap();

        let task = tokio::spawn(async move { broker.mediate().await });
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn mediate_rejects_invalid_heartbeat() {
        // Sub-millisecond intervals truncate to zero.
        for config in [
            BrokerConfig::default().with_heartbeat(Duration::ZERO, 3),
            BrokerConfig::default().with_heartbeat(Duration::from_micros(500), 3),
            BrokerConfig::default().with_heartbeat(Duration::from_millis(50), 0),
        ] {
            let mut broker = Broker::new(config);
            broker.bind("tcp://127.0.0.1:0").await.unwrap();
            let task = tokio::spawn(async move { broker.mediate().await });
            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(BrokerError::Config { .. })));
        }
    }

    #[test]
    fn stats_start_empty() {
        let broker = Broker::new(BrokerConfig::default());
        assert_eq!(broker.stats(), BrokerStats::default());
    }
}
