//! Split send/recv client.

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use rock_protocol::{ClientMessage, Endpoint};

use crate::client::validate_reply;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};

/// Client that sends now and collects the reply later.
///
/// At most one request may be outstanding per session; a second `send`
/// before `recv` fails with [`ClientError::RequestOutstanding`]. There are
/// no retries: a `recv` timeout drops the connection and the request.
pub struct AsyncClient {
    endpoint: Endpoint,
    config: ClientConfig,
    connection: Option<Connection>,
    outstanding: Option<String>,
}

impl AsyncClient {
    /// Creates a client for `address`. The connection opens on first `send`.
    pub fn new(address: &str, config: ClientConfig) -> ClientResult<Self> {
        Ok(Self {
            endpoint: address.parse()?,
            config,
            connection: None,
            outstanding: None,
        })
    }

    /// Creates a client and connects right away.
    pub async fn connect(address: &str, config: ClientConfig) -> ClientResult<Self> {
        let mut client = Self::new(address, config)?;
        client.connection = Some(Connection::open(&client.endpoint, client.config.verbose).await?);
        Ok(client)
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Service of the request awaiting its reply, if any.
    pub fn outstanding(&self) -> Option<&str> {
        self.outstanding.as_deref()
    }

    /// Sends a request without waiting for the reply.
    pub async fn send(&mut self, service: &str, body: Vec<Bytes>) -> ClientResult<()> {
        if let Some(service) = &self.outstanding {
            return Err(ClientError::RequestOutstanding {
                service: service.clone(),
            });
        }

        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => Connection::open(&self.endpoint, self.config.verbose).await?,
        };
        let connection = self.connection.insert(connection);

        let request = ClientMessage::new(service, body).to_frames();
        if let Err(e) = connection.send(&request).await {
            self.connection = None;
            return Err(e);
        }
        self.outstanding = Some(service.to_string());
        Ok(())
    }

    /// Waits up to the configured timeout for the outstanding reply.
    ///
    /// `Ok(None)` on timeout or when the broker went away.
    pub async fn recv(&mut self) -> ClientResult<Option<Vec<Bytes>>> {
        let service = self.outstanding.take().ok_or(ClientError::NoRequest)?;
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        match timeout(self.config.timeout(), connection.recv()).await {
            Ok(Some(Ok(frames))) => validate_reply(frames, &service).map(Some),
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Broker stream failed");
                self.connection = None;
                Ok(None)
            }
            Ok(None) => {
                debug!("Broker closed connection");
                self.connection = None;
                Ok(None)
            }
            Err(_) => {
                warn!(service = %service, "No reply within timeout");
                self.connection = None;
                Ok(None)
            }
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}
