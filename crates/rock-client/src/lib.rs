//! Client and worker agents for the rock broker.
//!
//! - [`Client`]: request/reply with per-attempt timeout, reconnect and a
//!   bounded retry budget. Exhausted retries are `Ok(None)`, not an error.
//! - [`AsyncClient`]: send now, `recv` later; one request at a time.
//! - [`Worker`]: registers a service, heartbeats, reconnects when the
//!   broker goes quiet, and hands request bodies to the caller.
//! - [`RpcProxy`] / [`AsyncRpcProxy`]: `{method, args}` calls over a client.

pub mod aclient;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod worker;

pub use aclient::AsyncClient;
pub use client::Client;
pub use config::{ClientConfig, WorkerConfig};
pub use connection::Connection;
pub use error::{ClientError, ClientResult};
pub use proxy::{AsyncRpcProxy, RpcProxy, timed_out_reply};
pub use worker::Worker;
