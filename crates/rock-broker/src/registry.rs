//! Service registry and worker lifecycle.
//!
//! The registry is the broker's whole routing state. It does no IO: every
//! handler takes the current instant and returns the messages the caller
//! must send, which keeps the state machine testable without sockets.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use rock_protocol::{ClientMessage, Multipart, WorkerMessage};

/// Opaque routing token assigned by the router socket.
pub type Identity = Bytes;

/// Short printable form of an identity for log lines.
pub fn display_identity(identity: &[u8]) -> String {
    identity.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Whether a worker can take a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

/// A registered worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub identity: Identity,
    pub service: String,
    pub expiry: Instant,
    pub state: WorkerState,
    /// Client whose request this worker is processing.
    pub in_flight: Option<Identity>,
}

impl WorkerRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expiry <= now
    }
}

/// A client request waiting for an idle worker.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client: Identity,
    pub body: Vec<Bytes>,
    pub arrived: Instant,
}

#[derive(Debug, Default)]
struct ServiceQueue {
    /// Oldest idle first.
    idle: VecDeque<Identity>,
    requests: VecDeque<PendingRequest>,
}

/// A message the broker must send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Identity,
    pub frames: Multipart,
}

impl Outbound {
    fn worker(to: Identity, message: &WorkerMessage) -> Self {
        Self {
            to,
            frames: message.to_frames(),
        }
    }

    fn request(worker: Identity, pending: PendingRequest) -> Self {
        Self::worker(
            worker,
            &WorkerMessage::Request {
                client: pending.client,
                body: pending.body,
            },
        )
    }
}

/// Snapshot of registry occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub services: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub pending_requests: usize,
}

/// Maps service names to idle workers and pending requests.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceQueue>,
    workers: HashMap<Identity, WorkerRecord>,
    liveness_window: Duration,
}

impl ServiceRegistry {
    /// Creates an empty registry. Workers silent for `liveness_window` expire.
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            services: HashMap::new(),
            workers: HashMap::new(),
            liveness_window,
        }
    }

    /// Routes a client request to the oldest idle worker, or queues it.
    pub fn on_client_request(
        &mut self,
        client: Identity,
        message: ClientMessage,
        now: Instant,
    ) -> Option<Outbound> {
        let ClientMessage { service, body } = message;
        let pending = PendingRequest {
            client,
            body,
            arrived: now,
        };

        let queue = self.services.entry(service.clone()).or_default();
        match take_idle(queue, &mut self.workers, now) {
            Some(worker) => {
                assign(&mut self.workers, &worker, &pending.client);
                debug!(
                    service = %service,
                    client = %display_identity(&pending.client),
                    worker = %display_identity(&worker),
                    "Dispatching request"
                );
                Some(Outbound::request(worker, pending))
            }
            None => {
                debug!(
                    service = %service,
                    client = %display_identity(&pending.client),
                    queued = queue.requests.len() + 1,
                    "No idle worker, queuing request"
                );
                queue.requests.push_back(pending);
                None
            }
        }
    }

    /// Applies a worker-side message. Returns what must be sent in response.
    pub fn on_worker_message(
        &mut self,
        worker: Identity,
        message: WorkerMessage,
        now: Instant,
    ) -> Vec<Outbound> {
        let expiry = now + self.liveness_window;

        match message {
            WorkerMessage::Ready { service } => {
                match self.workers.get_mut(&worker) {
                    Some(record) => {
                        if let Some(client) = record.in_flight.take() {
                            warn!(
                                worker = %display_identity(&worker),
                                client = %display_identity(&client),
                                "Worker re-registered while busy, in-flight request lost"
                            );
                        }
                        let previous = std::mem::replace(&mut record.service, service.clone());
                        record.expiry = expiry;
                        if let Some(queue) = self.services.get_mut(&previous) {
                            queue.idle.retain(|id| id != &worker);
                        }
                    }
                    None => {
                        self.workers.insert(
                            worker.clone(),
                            WorkerRecord {
                                identity: worker.clone(),
                                service: service.clone(),
                                expiry,
                                state: WorkerState::Idle,
                                in_flight: None,
                            },
                        );
                    }
                }
                debug!(service = %service, worker = %display_identity(&worker), "Worker ready");
                self.release(worker, now).into_iter().collect()
            }
            WorkerMessage::Reply { client, body } => {
                let Some(record) = self.workers.get_mut(&worker) else {
                    warn!(worker = %display_identity(&worker), "Reply from unknown worker");
                    return vec![Outbound::worker(worker, &WorkerMessage::Disconnect)];
                };
                record.expiry = expiry;

                let Some(recorded) = record.in_flight.take() else {
                    warn!(
                        worker = %display_identity(&worker),
                        "Reply from worker with no request in flight, dropping"
                    );
                    return Vec::new();
                };
                if recorded != client {
                    warn!(
                        worker = %display_identity(&worker),
                        expected = %display_identity(&recorded),
                        found = %display_identity(&client),
                        "Reply echoed a different client, routing to the recorded one"
                    );
                }

                let reply = Outbound {
                    to: recorded,
                    frames: ClientMessage::new(record.service.clone(), body).to_frames(),
                };
                let mut out = vec![reply];
                out.extend(self.release(worker, now));
                out
            }
            WorkerMessage::Heartbeat => match self.workers.get_mut(&worker) {
                Some(record) => {
                    record.expiry = expiry;
                    Vec::new()
                }
                None => {
                    debug!(worker = %display_identity(&worker), "Heartbeat from unknown worker");
                    vec![Outbound::worker(worker, &WorkerMessage::Disconnect)]
                }
            },
            WorkerMessage::Disconnect => {
                if self.remove_worker(&worker).is_some() {
                    debug!(worker = %display_identity(&worker), "Worker disconnected");
                }
                Vec::new()
            }
            WorkerMessage::Request { .. } => {
                warn!(
                    worker = %display_identity(&worker),
                    "Worker sent REQUEST, dropping"
                );
                Vec::new()
            }
        }
    }

    /// Hands the worker the next pending request for its service, or parks
    /// it at the back of the idle queue.
    fn release(&mut self, worker: Identity, now: Instant) -> Option<Outbound> {
        let record = self.workers.get_mut(&worker)?;
        let queue = self.services.entry(record.service.clone()).or_default();

        if let Some(pending) = queue.requests.pop_front() {
            record.state = WorkerState::Busy;
            record.in_flight = Some(pending.client.clone());
            debug!(
                service = %record.service,
                worker = %display_identity(&worker),
                waited_ms = now.saturating_duration_since(pending.arrived).as_millis() as u64,
                "Dispatching queued request"
            );
            return Some(Outbound::request(worker, pending));
        }

        record.state = WorkerState::Idle;
        record.in_flight = None;
        queue.idle.retain(|id| id != &worker);
        queue.idle.push_back(worker);
        None
    }

    fn remove_worker(&mut self, worker: &[u8]) -> Option<WorkerRecord> {
        let record = self.workers.remove(worker)?;
        if let Some(queue) = self.services.get_mut(&record.service) {
            queue.idle.retain(|id| id.as_ref() != worker);
        }
        Some(record)
    }

    /// Removes every worker whose expiry has passed. Returns their identities.
    pub fn purge(&mut self, now: Instant) -> Vec<Identity> {
        let expired: Vec<Identity> = self
            .workers
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| record.identity.clone())
            .collect();

        for identity in &expired {
            if let Some(record) = self.remove_worker(identity) {
                debug!(
                    service = %record.service,
                    worker = %display_identity(identity),
                    state = ?record.state,
                    "Purging expired worker"
                );
            }
        }
        expired
    }

    /// Heartbeats for every idle worker.
    pub fn heartbeats(&self) -> Vec<Outbound> {
        self.workers
            .values()
            .filter(|record| record.state == WorkerState::Idle)
            .map(|record| Outbound::worker(record.identity.clone(), &WorkerMessage::Heartbeat))
            .collect()
    }

    /// Forgets a peer whose connection closed: its worker record, if any,
    /// and any requests it has waiting.
    pub fn peer_gone(&mut self, identity: &[u8]) {
        if let Some(record) = self.remove_worker(identity) {
            debug!(
                service = %record.service,
                worker = %display_identity(identity),
                "Worker connection closed"
            );
        }

        let mut dropped = 0;
        for queue in self.services.values_mut() {
            let before = queue.requests.len();
            queue
                .requests
                .retain(|pending| pending.client.as_ref() != identity);
            dropped += before - queue.requests.len();
        }
        if dropped > 0 {
            debug!(
                client = %display_identity(identity),
                dropped,
                "Dropped queued requests of closed client"
            );
        }
    }

    /// Removes every worker and returns a DISCONNECT for each.
    pub fn drain(&mut self) -> Vec<Outbound> {
        for queue in self.services.values_mut() {
            queue.idle.clear();
        }
        self.workers
            .drain()
            .map(|(identity, _)| Outbound::worker(identity, &WorkerMessage::Disconnect))
            .collect()
    }

    /// Looks up a worker record.
    pub fn worker(&self, identity: &[u8]) -> Option<&WorkerRecord> {
        self.workers.get(identity)
    }

    /// Number of requests waiting for `service`.
    pub fn pending(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map_or(0, |queue| queue.requests.len())
    }

    /// Idle worker identities for `service`, oldest first.
    pub fn idle_workers(&self, service: &str) -> Vec<Identity> {
        self.services
            .get(service)
            .map(|queue| queue.idle.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current occupancy.
    pub fn stats(&self) -> RegistryStats {
        let busy = self
            .workers
            .values()
            .filter(|record| record.state == WorkerState::Busy)
            .count();
        RegistryStats {
            services: self.services.len(),
            idle_workers: self.workers.len() - busy,
            busy_workers: busy,
            pending_requests: self.services.values().map(|q| q.requests.len()).sum(),
        }
    }
}

/// Pops the oldest live idle worker, dropping expired ones on the way.
fn take_idle(
    queue: &mut ServiceQueue,
    workers: &mut HashMap<Identity, WorkerRecord>,
    now: Instant,
) -> Option<Identity> {
    while let Some(identity) = queue.idle.pop_front() {
        match workers.get(&identity) {
            Some(record) if record.is_expired(now) => {
                debug!(worker = %display_identity(&identity), "Skipping expired idle worker");
                workers.remove(&identity);
            }
            Some(_) => return Some(identity),
            None => {}
        }
    }
    None
}

fn assign(workers: &mut HashMap<Identity, WorkerRecord>, worker: &[u8], client: &Identity) {
    if let Some(record) = workers.get_mut(worker) {
        record.state = WorkerState::Busy;
        record.in_flight = Some(client.clone());
    }
}
