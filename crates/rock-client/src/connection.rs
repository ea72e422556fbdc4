//! Dealer-style connection to a broker.
//!
//! One stream, no identity on the wire. Inbound messages are read by a
//! background task into a channel so `recv` can be raced against timers
//! without tearing a message in half.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rock_protocol::{BoxWriter, Endpoint, FrameReader, FrameWriter, Multipart, ProtocolResult, dump};

use crate::error::{ClientError, ClientResult};

const INBOUND_DEPTH: usize = 64;

/// A live connection to a broker.
pub struct Connection {
    endpoint: Endpoint,
    writer: FrameWriter<BoxWriter>,
    inbound: mpsc::Receiver<ProtocolResult<Multipart>>,
    reader: JoinHandle<()>,
    verbose: bool,
}

impl Connection {
    /// Connects to `endpoint`.
    pub async fn open(endpoint: &Endpoint, verbose: bool) -> ClientResult<Self> {
        let (reader, writer) = endpoint
            .connect()
            .await
            .map_err(|e| ClientError::connection(endpoint, e))?;
        debug!(endpoint = %endpoint, "Connected to broker");

        let (tx, inbound) = mpsc::channel(INBOUND_DEPTH);
        let reader = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_multipart().await {
                    Ok(Some(frames)) => {
                        if tx.send(Ok(frames)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            endpoint: endpoint.clone(),
            writer: FrameWriter::new(writer),
            inbound,
            reader,
            verbose,
        })
    }

    /// The endpoint this connection was opened to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Writes one message.
    pub async fn send(&mut self, frames: &[Bytes]) -> ClientResult<()> {
        self.trace("O", frames);
        self.writer.write_multipart(frames).await?;
        Ok(())
    }

    /// Waits for the next message. `None` once the broker closed the stream.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<ProtocolResult<Multipart>> {
        let message = self.inbound.recv().await;
        if let Some(Ok(frames)) = &message {
            self.trace("I", frames);
        }
        message
    }

    /// Shuts the write half down so the broker sees EOF.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }

    fn trace(&self, direction: &str, frames: &[Bytes]) {
        if self.verbose {
            info!(endpoint = %self.endpoint, "{direction}: {}", dump(frames));
        } else {
            debug!(endpoint = %self.endpoint, "{direction}: {}", dump(frames));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_and_recv_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut reader = FrameReader::new(reader);
            let mut writer = FrameWriter::new(writer);
            let frames = reader.read_multipart().await.unwrap().unwrap();
            writer.write_multipart(&frames).await.unwrap();
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut connection = Connection::open(&endpoint, false).await.unwrap();
        let frames = vec![Bytes::new(), Bytes::from_static(b"MDPC01")];
        connection.send(&frames).await.unwrap();

        assert_eq!(connection.recv().await.unwrap().unwrap(), frames);
        server.await.unwrap();
        assert!(connection.recv().await.is_none());
    }

    #[tokio::test]
    async fn open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let result = Connection::open(&endpoint, false).await;
        assert!(matches!(result, Err(ClientError::Connection { .. })));
    }
}
