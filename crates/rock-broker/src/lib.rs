//! Broker: service registry, worker liveness and request routing.
//!
//! The broker binds one or more endpoints shared by clients and workers,
//! tells them apart by protocol signature, and routes each client request
//! to the oldest idle worker registered for the named service. Requests for
//! a service with no idle worker wait in a FIFO queue. Workers that stay
//! silent for `heartbeat_interval × heartbeat_liveness` are purged.
//!
//! # Example
//!
//! ```rust,no_run
//! use rock_broker::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut broker = Broker::new(BrokerConfig::new("main").with_verbose(true));
//!     broker.bind("tcp://*:5555").await?;
//!     broker.bind("ipc:///tmp/rock-broker.sock").await?;
//!     broker.mediate().await?;
//!     Ok(())
//! }
//! ```

mod broker;
mod config;
mod error;
mod registry;
mod socket;

pub use broker::{Broker, BrokerStats};
pub use config::{BrokerConfig, DEFAULT_ENDPOINT};
pub use error::{BrokerError, BrokerResult};
pub use registry::{
    Identity, Outbound, PendingRequest, RegistryStats, ServiceRegistry, WorkerRecord,
    WorkerState, display_identity,
};
pub use socket::{RouterEvent, RouterSocket};
