//! Request/reply client with timeout, reconnect and retry.

use bytes::Bytes;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, warn};

use rock_protocol::{ClientMessage, Endpoint, Multipart};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};

/// Client session: one broker, one request at a time.
///
/// `send` returns only once it has a reply or has used up its attempts.
/// Every attempt runs on a fresh connection after the first failure, so a
/// late reply to an abandoned attempt can never be mistaken for a new one.
pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    connection: Option<Connection>,
}

impl Client {
    /// Creates a client for `address`.
    ///
    /// An unparsable address fails here. An unreachable broker does not:
    /// the connection is retried by `send`.
    pub async fn connect(address: &str, config: ClientConfig) -> ClientResult<Self> {
        let endpoint: Endpoint = address.parse()?;
        let mut client = Self {
            endpoint,
            config,
            connection: None,
        };
        client.reconnect().await;
        Ok(client)
    }

    /// The broker endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn reconnect(&mut self) {
        self.connection = None;
        match Connection::open(&self.endpoint, self.config.verbose).await {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => debug!(error = %e, "Broker unreachable"),
        }
    }

    /// Sends a request to `service` and waits for its reply.
    ///
    /// Returns `Ok(None)` when every attempt timed out. Errors are reserved
    /// for replies that break the protocol.
    pub async fn send(&mut self, service: &str, body: Vec<Bytes>) -> ClientResult<Option<Vec<Bytes>>> {
        let request = ClientMessage::new(service, body).to_frames();
        let attempts = self.config.retries.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 || self.connection.is_none() {
                self.reconnect().await;
            }

            let deadline = Instant::now() + self.config.timeout();
            if let Some(reply) = self.attempt(&request, service, deadline).await? {
                return Ok(Some(reply));
            }

            if attempt < attempts {
                warn!(service, attempt, "No reply, reconnecting and retrying");
            }
        }

        warn!(service, attempts, "No reply, abandoning request");
        self.connection = None;
        Ok(None)
    }

    /// One bounded attempt. `Ok(None)` when the deadline passed.
    async fn attempt(
        &mut self,
        request: &Multipart,
        service: &str,
        deadline: Instant,
    ) -> ClientResult<Option<Vec<Bytes>>> {
        let Some(connection) = self.connection.as_mut() else {
            sleep_until(deadline).await;
            return Ok(None);
        };

        if let Err(e) = connection.send(request).await {
            debug!(error = %e, "Send failed");
            self.connection = None;
            sleep_until(deadline).await;
            return Ok(None);
        }

        match timeout_at(deadline, connection.recv()).await {
            Ok(Some(Ok(frames))) => validate_reply(frames, service).map(Some),
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Broker stream failed");
                self.connection = None;
                sleep_until(deadline).await;
                Ok(None)
            }
            Ok(None) => {
                debug!("Broker closed connection");
                self.connection = None;
                sleep_until(deadline).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

/// Checks signature and service of a reply and returns its body.
pub(crate) fn validate_reply(frames: Multipart, service: &str) -> ClientResult<Vec<Bytes>> {
    let reply = ClientMessage::parse(frames)?;
    if reply.service != service {
        return Err(ClientError::ServiceMismatch {
            expected: service.to_string(),
            found: reply.service,
        });
    }
    Ok(reply.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rock_protocol::ProtocolError;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn validate_reply_checks_service() {
        let frames = ClientMessage::new("echo", vec![Bytes::from_static(b"x")]).to_frames();
        assert_eq!(
            validate_reply(frames.clone(), "echo").unwrap(),
            vec![Bytes::from_static(b"x")]
        );
        assert!(matches!(
            validate_reply(frames, "other"),
            Err(ClientError::ServiceMismatch { .. })
        ));
    }

    #[test]
    fn validate_reply_checks_signature() {
        let frames = vec![Bytes::new(), Bytes::from_static(b"MDPW01"), Bytes::from_static(b"echo")];
        assert!(matches!(
            validate_reply(frames, "echo"),
            Err(ClientError::Protocol(ProtocolError::InvalidSignature { .. }))
        ));
    }

    #[tokio::test]
    async fn bad_address_is_fatal() {
        let result = Client::connect("nowhere", ClientConfig::default()).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn silent_broker_yields_no_reply_after_every_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                held.push(stream);
                if held.len() == 3 {
                    return held.len();
                }
            }
            held.len()
        });

        let config = ClientConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_retries(3);
        let mut client = Client::connect(&format!("tcp://127.0.0.1:{port}"), config)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let reply = client.send("echo", vec![]).await.unwrap();
        assert!(reply.is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(accepts.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unreachable_broker_yields_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::default()
            .with_timeout(Duration::from_millis(20))
            .with_retries(2);
        let mut client = Client::connect(&format!("tcp://127.0.0.1:{port}"), config)
            .await
            .unwrap();
        assert!(client.send("echo", vec![]).await.unwrap().is_none());
    }
}
