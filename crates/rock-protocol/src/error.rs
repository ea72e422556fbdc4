//! Protocol error types.

use thiserror::Error;

use crate::Codec;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing, parsing or encoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: u32 },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed or buffer ended before a full message arrived.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// A message with no frames.
    #[error("empty message")]
    EmptyMessage,

    /// Signature frame did not match the expected protocol.
    #[error("invalid protocol signature: expected {expected}, found {found:?}")]
    InvalidSignature { expected: &'static str, found: String },

    /// Command frame did not hold a known command byte.
    #[error("unknown command: {0:?}")]
    UnknownCommand(Vec<u8>),

    /// A required frame was absent.
    #[error("missing {0} frame")]
    MissingFrame(&'static str),

    /// Frames are present but not laid out as the envelope requires.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Service name frame was not valid UTF-8.
    #[error("service name is not valid UTF-8")]
    InvalidServiceName,

    /// Codec header did not name a known codec.
    #[error("unknown codec header: {0:?}")]
    UnknownCodec(String),

    /// Payload could not be encoded.
    #[error("{codec} encode failed: {message}")]
    Encode { codec: Codec, message: String },

    /// Payload could not be decoded.
    #[error("{codec} decode failed: {message}")]
    Decode { codec: Codec, message: String },

    /// RPC arguments were not a JSON object.
    #[error("rpc args must be an object, got {0}")]
    InvalidArgs(&'static str),

    /// Endpoint string could not be parsed.
    #[error("invalid endpoint {0:?}: expected tcp://host:port or ipc://path")]
    InvalidEndpoint(String),

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates a malformed envelope error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope(message.into())
    }

    /// Returns true for errors caused by a peer's bytes rather than our IO.
    ///
    /// Such messages are dropped and logged; the connection stays usable.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature { .. }
                | Self::UnknownCommand(_)
                | Self::MissingFrame(_)
                | Self::MalformedEnvelope(_)
                | Self::InvalidServiceName
                | Self::UnknownCodec(_)
                | Self::Decode { .. }
        )
    }
}
