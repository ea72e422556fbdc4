//! Shared plumbing for rock processes: tracing setup and shutdown signalling.
//!
//! Library crates never install a global subscriber themselves; binaries call
//! [`init_tracing`] once and hand a [`ShutdownHandle`] to each component they
//! start.

pub mod signals;
pub mod tracing;

pub use signals::{ShutdownHandle, SignalHandler};
pub use tracing::{LOG_FORMAT_ENV, TracingConfig, TracingError, TracingOutputFormat, init_tracing};
