//! Worker agent: registers a service and answers requests.

use bytes::Bytes;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use rock_core::ShutdownHandle;
use rock_protocol::{Endpoint, WorkerMessage};

use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};

/// Worker session for one service.
///
/// ```rust,no_run
/// use rock_client::{Worker, WorkerConfig};
///
/// # async fn run() -> rock_client::ClientResult<()> {
/// let mut worker = Worker::connect("tcp://localhost:5555", "echo", WorkerConfig::default()).await?;
/// while let Some(body) = worker.recv().await {
///     worker.reply(body).await?;
/// }
/// worker.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    endpoint: Endpoint,
    service: String,
    config: WorkerConfig,
    connection: Option<Connection>,
    liveness: u32,
    heartbeat_at: Instant,
    reply_to: Option<Bytes>,
    shutdown: ShutdownHandle,
}

impl Worker {
    /// Creates a worker for `service` and registers it with the broker.
    ///
    /// An unparsable address or a zero heartbeat setting fails here; an
    /// unreachable broker is retried from `recv`.
    pub async fn connect(
        address: &str,
        service: impl Into<String>,
        config: WorkerConfig,
    ) -> ClientResult<Self> {
        let service = service.into();
        if service.is_empty() {
            return Err(ClientError::Config("service name must not be empty".into()));
        }
        if config.heartbeat_interval_ms == 0 {
            return Err(ClientError::Config(
                "heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if config.heartbeat_liveness == 0 {
            return Err(ClientError::Config(
                "heartbeat_liveness must be greater than zero".into(),
            ));
        }
        let mut worker = Self {
            endpoint: address.parse()?,
            service,
            liveness: config.heartbeat_liveness,
            heartbeat_at: Instant::now() + config.heartbeat_interval(),
            config,
            connection: None,
            reply_to: None,
            shutdown: ShutdownHandle::new(),
        };
        worker.connect_to_broker().await;
        Ok(worker)
    }

    /// Builder: make `recv` return `None` once this handle fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The service this worker serves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether a broker connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Returns a handle that stops `recv`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    async fn connect_to_broker(&mut self) {
        self.connection = None;
        self.reply_to = None;

        let mut connection = match Connection::open(&self.endpoint, self.config.verbose).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(service = %self.service, error = %e, "Cannot reach broker");
                return;
            }
        };

        let ready = WorkerMessage::Ready {
            service: self.service.clone(),
        };
        if let Err(e) = connection.send(&ready.to_frames()).await {
            warn!(service = %self.service, error = %e, "Failed to register with broker");
            return;
        }

        info!(service = %self.service, endpoint = %self.endpoint, "Registered with broker");
        self.connection = Some(connection);
        self.liveness = self.config.heartbeat_liveness;
        self.heartbeat_at = Instant::now() + self.config.heartbeat_interval();
    }

    /// Waits for the next request and returns its body.
    ///
    /// Heartbeats and reconnects happen in here. Returns `None` only when
    /// the shutdown handle fires.
    pub async fn recv(&mut self) -> Option<Vec<Bytes>> {
        if self.reply_to.take().is_some() {
            warn!(service = %self.service, "Previous request was never answered");
        }

        loop {
            if self.shutdown.is_shutdown() {
                return None;
            }

            if self.connection.is_none() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return None,
                    _ = sleep(self.config.reconnect_delay()) => {}
                }
                self.connect_to_broker().await;
                continue;
            }

            let interval = self.config.heartbeat_interval();
            let received = match self.connection.as_mut() {
                Some(connection) => tokio::select! {
                    _ = self.shutdown.cancelled() => return None,
                    received = timeout(interval, connection.recv()) => received,
                },
                None => continue,
            };

            match received {
                Ok(Some(Ok(frames))) => {
                    self.liveness = self.config.heartbeat_liveness;
                    match WorkerMessage::parse(frames) {
                        Ok(WorkerMessage::Request { client, body }) => {
                            self.reply_to = Some(client);
                            return Some(body);
                        }
                        Ok(WorkerMessage::Heartbeat) => {}
                        Ok(WorkerMessage::Disconnect) => {
                            info!(service = %self.service, "Broker asked us to disconnect");
                            self.connection = None;
                        }
                        Ok(other) => {
                            warn!(command = %other.command(), "Unexpected command from broker");
                        }
                        Err(e) => warn!(error = %e, "Dropping invalid message from broker"),
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Broker stream failed, reconnecting");
                    self.connection = None;
                }
                Ok(None) => {
                    warn!(service = %self.service, "Broker closed connection, reconnecting");
                    self.connection = None;
                }
                Err(_) => {
                    self.liveness = self.liveness.saturating_sub(1);
                    if self.liveness == 0 {
                        warn!(service = %self.service, "Broker silent, reconnecting");
                        self.connection = None;
                    }
                }
            }

            if self.connection.is_some() && Instant::now() >= self.heartbeat_at {
                self.heartbeat().await;
            }
        }
    }

    /// Sends the reply for the request last returned by `recv`.
    ///
    /// A reply that cannot be delivered is logged and dropped; the client
    /// will time out and retry.
    pub async fn reply(&mut self, body: Vec<Bytes>) -> ClientResult<()> {
        let client = self.reply_to.take().ok_or(ClientError::NoRequest)?;
        let Some(connection) = self.connection.as_mut() else {
            warn!(service = %self.service, "Not connected, dropping reply");
            return Ok(());
        };

        let reply = WorkerMessage::Reply { client, body };
        if let Err(e) = connection.send(&reply.to_frames()).await {
            warn!(service = %self.service, error = %e, "Failed to send reply");
            self.connection = None;
        }
        Ok(())
    }

    /// Sends a heartbeat now. Long handlers call this to stay registered.
    pub async fn heartbeat(&mut self) {
        self.heartbeat_at = Instant::now() + self.config.heartbeat_interval();
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = connection.send(&WorkerMessage::Heartbeat.to_frames()).await {
            debug!(error = %e, "Failed to send heartbeat");
            self.connection = None;
        }
    }

    /// Tells the broker this worker is leaving and closes the connection.
    pub async fn close(mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.send(&WorkerMessage::Disconnect.to_frames()).await {
                debug!(error = %e, "Failed to send disconnect");
            }
            connection.close().await;
            info!(service = %self.service, "Worker disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rock_protocol::{BoxReader, BoxWriter, FrameReader, FrameWriter};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct FakeBroker {
        listener: TcpListener,
        address: String,
    }

    impl FakeBroker {
        async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = format!("tcp://{}", listener.local_addr().unwrap());
            Self { listener, address }
        }

        async fn accept(&self) -> (FrameReader<BoxReader>, FrameWriter<BoxWriter>) {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
                .await
                .unwrap()
                .unwrap();
            let (reader, writer) = stream.into_split();
            (
                FrameReader::new(Box::new(reader) as BoxReader),
                FrameWriter::new(Box::new(writer) as BoxWriter),
            )
        }
    }

    async fn next(reader: &mut FrameReader<BoxReader>) -> WorkerMessage {
        let frames = tokio::time::timeout(Duration::from_secs(5), reader.read_multipart())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        WorkerMessage::parse(frames).unwrap()
    }

    fn fast() -> WorkerConfig {
        WorkerConfig::default()
            .with_heartbeat(Duration::from_millis(30), 3)
            .with_reconnect_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn registers_and_answers() {
        let broker = FakeBroker::bind().await;
        let mut worker = Worker::connect(&broker.address, "echo", fast()).await.unwrap();
        let (mut reader, mut writer) = broker.accept().await;

        assert_eq!(
            next(&mut reader).await,
            WorkerMessage::Ready {
                service: "echo".into()
            }
        );

        let request = WorkerMessage::Request {
            client: Bytes::from_static(b"c1"),
            body: vec![Bytes::from_static(b"ping")],
        };
        writer.write_multipart(&request.to_frames()).await.unwrap();

        let body = worker.recv().await.unwrap();
        worker.reply(body).await.unwrap();

        loop {
            match next(&mut reader).await {
                WorkerMessage::Heartbeat => continue,
                reply => {
                    assert_eq!(
                        reply,
                        WorkerMessage::Reply {
                            client: Bytes::from_static(b"c1"),
                            body: vec![Bytes::from_static(b"ping")],
                        }
                    );
                    break;
                }
            }
        }

        assert!(matches!(
            worker.reply(vec![]).await,
            Err(ClientError::NoRequest)
        ));
    }

    #[tokio::test]
    async fn heartbeats_while_idle_and_reconnects_when_broker_silent() {
        let broker = FakeBroker::bind().await;
        let shutdown = ShutdownHandle::new();
        let worker = Worker::connect(&broker.address, "echo", fast())
            .await
            .unwrap()
            .with_shutdown(shutdown.clone());
        let task = tokio::spawn(async move {
            let mut worker = worker;
            worker.recv().await
        });

        let (mut first, _first_writer) = broker.accept().await;
        assert!(matches!(next(&mut first).await, WorkerMessage::Ready { .. }));
        assert_eq!(next(&mut first).await, WorkerMessage::Heartbeat);

        // Never answering exhausts liveness and forces a fresh READY.
        let (mut second, _second_writer) = broker.accept().await;
        assert!(matches!(next(&mut second).await, WorkerMessage::Ready { .. }));

        shutdown.trigger();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broker_disconnect_triggers_reregistration() {
        let broker = FakeBroker::bind().await;
        let shutdown = ShutdownHandle::new();
        let worker = Worker::connect(&broker.address, "echo", fast())
            .await
            .unwrap()
            .with_shutdown(shutdown.clone());
        let task = tokio::spawn(async move {
            let mut worker = worker;
            worker.recv().await
        });

        let (mut reader, mut writer) = broker.accept().await;
        assert!(matches!(next(&mut reader).await, WorkerMessage::Ready { .. }));
        writer
            .write_multipart(&WorkerMessage::Disconnect.to_frames())
            .await
            .unwrap();

        let (mut again, _again_writer) = broker.accept().await;
        assert!(matches!(next(&mut again).await, WorkerMessage::Ready { .. }));

        shutdown.trigger();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_sends_disconnect() {
        let broker = FakeBroker::bind().await;
        let worker = Worker::connect(&broker.address, "echo", fast()).await.unwrap();
        let (mut reader, _writer) = broker.accept().await;
        assert!(matches!(next(&mut reader).await, WorkerMessage::Ready { .. }));

        worker.close().await;
        assert_eq!(next(&mut reader).await, WorkerMessage::Disconnect);
    }

    #[tokio::test]
    async fn empty_service_is_rejected() {
        let result = Worker::connect("tcp://127.0.0.1:1", "", WorkerConfig::default()).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn zero_heartbeat_settings_are_rejected() {
        let broker = FakeBroker::bind().await;
        for config in [
            WorkerConfig::default().with_heartbeat(Duration::ZERO, 3),
            WorkerConfig::default().with_heartbeat(Duration::from_micros(500), 3),
            WorkerConfig::default().with_heartbeat(Duration::from_millis(30), 0),
        ] {
            let result = Worker::connect(&broker.address, "echo", config).await;
            assert!(matches!(result, Err(ClientError::Config(_))));
        }
    }
}
