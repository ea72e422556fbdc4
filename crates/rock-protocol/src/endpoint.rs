//! Transport endpoints.
//!
//! `tcp://host:port` (with `*` as the host meaning every interface when
//! binding) and `ipc:///path/to.sock` for Unix domain sockets.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;

/// Boxed read half of a connected stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connected stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP; `host` may be `*` for binds.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    Ipc(PathBuf),
}

impl Endpoint {
    /// Address suitable for `TcpListener::bind`, `*` becoming `0.0.0.0`.
    pub fn bind_address(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{port}")),
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Ipc(_) => None,
        }
    }

    /// Opens a stream to this endpoint and splits it into halves.
    pub async fn connect(&self) -> io::Result<(BoxReader, BoxWriter)> {
        match self {
            Self::Tcp { host, .. } if host == "*" => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot connect to wildcard host '*'",
            )),
            Self::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect(format!("{host}:{port}")).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            Self::Ipc(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(not(unix))]
            Self::Ipc(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ipc:// endpoints require a unix platform",
            )),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok(Self::Tcp {
                host: host.to_string(),
                port,
            })
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid());
            }
            Ok(Self::Ipc(PathBuf::from(path)))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
