//! Client and worker error types.

use std::io;
use thiserror::Error;

use rock_protocol::ProtocolError;

/// Result type for client and worker operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client and worker agents.
///
/// A timed-out attempt is never an error; `send` reports it as no reply.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Protocol error (endpoint parsing, framing, codec).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection to the broker failed.
    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    /// Reply named a different service than the request.
    #[error("reply for service {found:?}, expected {expected:?}")]
    ServiceMismatch { expected: String, found: String },

    /// A request is already awaiting its reply on this session.
    #[error("request to {service:?} still outstanding")]
    RequestOutstanding { service: String },

    /// `recv` or `reply` called with no request to match.
    #[error("no request outstanding")]
    NoRequest,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Creates a connection error.
    pub fn connection(endpoint: impl ToString, message: impl ToString) -> Self {
        Self::Connection {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }
}
