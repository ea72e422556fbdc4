//! Service error types.

use std::io;
use thiserror::Error;

use rock_client::ClientError;
use rock_protocol::ProtocolError;

/// Result type for service setup and run.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that stop a service. Handler failures never show up here; they
/// become error replies.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Worker agent error.
    #[error("worker error: {0}")]
    Client(#[from] ClientError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Storage error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ServiceError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No driver registered under this name.
    #[error("unknown store driver: {0}")]
    UnknownDriver(String),

    /// No document with this key.
    #[error("{shard}.{table}: no document with key {pk:?}")]
    NotFound {
        shard: String,
        table: String,
        pk: String,
    },

    /// Document is not a JSON object or has an unusable key.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Store was closed.
    #[error("store is closed")]
    Closed,
}
