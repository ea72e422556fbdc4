//! Router-style socket over tokio listeners.
//!
//! Every accepted connection gets a random identity. Inbound messages are
//! tagged with it; outbound messages are addressed by it. A peer's outbound
//! queue is bounded, and messages for a full or vanished peer are dropped.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rock_core::ShutdownHandle;
use rock_protocol::{BoxReader, BoxWriter, Endpoint, FrameReader, FrameWriter, Multipart};

use crate::error::{BrokerError, BrokerResult};
use crate::registry::{Identity, display_identity};

/// Depth of the shared inbound event queue.
const INBOUND_DEPTH: usize = 1024;

struct Peer {
    sender: mpsc::Sender<Multipart>,
    writer: JoinHandle<()>,
}

/// What the router hands to the routing loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A message from a connected peer.
    Message { identity: Identity, frames: Multipart },
    /// A peer's connection closed.
    Disconnected(Identity),
}

enum PeerEvent {
    Connected { identity: Identity, peer: Peer },
    Message {
        identity: Identity,
        frames: Multipart,
    },
    Closed(Identity),
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<(BoxReader, BoxWriter)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

/// A bound endpoint and its accept loop.
struct Bound {
    endpoint: Endpoint,
    task: JoinHandle<()>,
    socket_path: Option<PathBuf>,
}

impl Drop for Bound {
    fn drop(&mut self) {
        self.task.abort();

        if let Some(path) = &self.socket_path
            && path.exists()
        {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(path = %path.display(), "Removed socket file");
            }
        }
    }
}

/// Router socket: many peers, addressed by identity.
pub struct RouterSocket {
    bound: Vec<Bound>,
    peers: HashMap<Identity, Peer>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    peer_queue_depth: usize,
    cleanup_stale_socket: bool,
    closed: ShutdownHandle,
}

impl RouterSocket {
    /// Creates an unbound router.
    pub fn new(peer_queue_depth: usize, cleanup_stale_socket: bool) -> Self {
        let (events_tx, events_rx) = mpsc::channel(INBOUND_DEPTH);
        Self {
            bound: Vec::new(),
            peers: HashMap::new(),
            events_tx,
            events_rx,
            peer_queue_depth: peer_queue_depth.max(1),
            cleanup_stale_socket,
            closed: ShutdownHandle::new(),
        }
    }

    /// Binds an endpoint and starts accepting on it.
    ///
    /// Returns the endpoint actually bound, so `tcp://127.0.0.1:0` reports
    /// the port the OS picked.
    pub async fn bind(&mut self, endpoint: &Endpoint) -> BrokerResult<Endpoint> {
        let (listener, resolved, socket_path) = match endpoint {
            Endpoint::Tcp { host, .. } => {
                let address = endpoint
                    .bind_address()
                    .ok_or_else(|| BrokerError::config(format!("cannot bind {endpoint}")))?;
                let listener = TcpListener::bind(&address).await?;
                let port = listener.local_addr()?.port();
                let resolved = Endpoint::Tcp {
                    host: host.clone(),
                    port,
                };
                (Listener::Tcp(listener), resolved, None)
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let listener = self.bind_unix(path).await?;
                (Listener::Unix(listener), endpoint.clone(), Some(path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(BrokerError::config(format!(
                    "{endpoint}: ipc endpoints require a unix platform"
                )));
            }
        };

        info!(endpoint = %resolved, "Router listening");

        let task = tokio::spawn(accept_loop(
            listener,
            resolved.clone(),
            self.events_tx.clone(),
            self.peer_queue_depth,
            self.closed.clone(),
        ));
        self.bound.push(Bound {
            endpoint: resolved.clone(),
            task,
            socket_path,
        });
        Ok(resolved)
    }

    #[cfg(unix)]
    async fn bind_unix(&self, path: &std::path::Path) -> BrokerResult<UnixListener> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(BrokerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if path.exists() {
            if !self.cleanup_stale_socket {
                return Err(BrokerError::socket_in_use(path.to_string_lossy().to_string()));
            }
            match tokio::net::UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(BrokerError::socket_in_use(
                        path.to_string_lossy().to_string(),
                    ));
                }
                Err(_) => {
                    info!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path)?;
                }
            }
        }

        Ok(UnixListener::bind(path)?)
    }

    /// Endpoints currently bound.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.bound.iter().map(|b| b.endpoint.clone()).collect()
    }

    /// Whether at least one endpoint is bound.
    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queues a message for a peer. Returns false if it was dropped.
    pub fn send(&mut self, identity: &[u8], frames: Multipart) -> bool {
        let Some(Peer { sender, .. }) = self.peers.get(identity) else {
            debug!(peer = %display_identity(identity), "Peer gone, dropping message");
            return false;
        };

        match sender.try_send(frames) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    peer = %display_identity(identity),
                    depth = self.peer_queue_depth,
                    "Peer queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %display_identity(identity), "Peer writer closed");
                self.peers.remove(identity);
                false
            }
        }
    }

    /// Waits for the next inbound message or disconnect.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        loop {
            match self.events_rx.recv().await? {
                PeerEvent::Connected { identity, peer } => {
                    debug!(peer = %display_identity(&identity), "Peer connected");
                    self.peers.insert(identity, peer);
                }
                PeerEvent::Message { identity, frames } => {
                    return Some(RouterEvent::Message { identity, frames });
                }
                PeerEvent::Closed(identity) => {
                    self.peers.remove(&identity);
                    return Some(RouterEvent::Disconnected(identity));
                }
            }
        }
    }
}

impl RouterSocket {
    /// Stops accepting, then waits up to `linger` for queued outbound
    /// messages to be written.
    pub async fn close(&mut self, linger: Duration) {
        self.bound.clear();
        let writers: Vec<JoinHandle<()>> = self.peers.drain().map(|(_, peer)| peer.writer).collect();
        self.closed.trigger();

        let flushed = tokio::time::timeout(linger, async {
            for writer in writers {
                let _ = writer.await;
            }
        })
        .await;
        if flushed.is_err() {
            debug!(linger_ms = linger.as_millis() as u64, "Linger expired with unsent messages");
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.closed.trigger();
    }
}

async fn accept_loop(
    listener: Listener,
    endpoint: Endpoint,
    events: mpsc::Sender<PeerEvent>,
    depth: usize,
    closed: ShutdownHandle,
) {
    loop {
        match listener.accept().await {
            Ok((reader, writer)) => {
                tokio::spawn(serve_peer(
                    reader,
                    writer,
                    events.clone(),
                    depth,
                    closed.clone(),
                ));
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn serve_peer(
    reader: BoxReader,
    writer: BoxWriter,
    events: mpsc::Sender<PeerEvent>,
    depth: usize,
    closed: ShutdownHandle,
) {
    let identity = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());
    let (sender, mut outbound) = mpsc::channel::<Multipart>(depth);

    let peer = display_identity(&identity);
    let writer_peer = peer.clone();
    // Exits once the router drops the sender and the queue is drained.
    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(frames) = outbound.recv().await {
            if let Err(e) = writer.write_multipart(&frames).await {
                debug!(peer = %writer_peer, error = %e, "Write failed, closing peer writer");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let connected = PeerEvent::Connected {
        identity: identity.clone(),
        peer: Peer { sender, writer },
    };
    if events.send(connected).await.is_err() {
        return;
    }

    let mut reader = FrameReader::new(reader);
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            result = reader.read_multipart() => match result {
                Ok(Some(frames)) => {
                    let event = PeerEvent::Message { identity: identity.clone(), frames };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Framing error, closing connection");
                    break;
                }
            },
        }
    }

    let _ = events.send(PeerEvent::Closed(identity)).await;
}
