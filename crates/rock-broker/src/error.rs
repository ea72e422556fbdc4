//! Broker error types.

use std::io;
use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced to the process embedding the broker.
///
/// Peer misbehaviour never shows up here; it is logged and dropped inside
/// the routing loop.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// IO error (bind, accept, socket file).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (endpoint parsing, framing).
    #[error("Protocol error: {0}")]
    Protocol(#[from] rock_protocol::ProtocolError),

    /// Socket path already in use by a live listener.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("Socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// `mediate` called before any `bind`.
    #[error("Broker has no bound endpoints")]
    NotBound,
}

impl BrokerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a socket in use error.
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    /// Creates a socket path invalid error.
    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }
}
