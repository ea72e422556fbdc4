//! Client and worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rock_protocol::Codec;

/// Client agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt reply timeout.
    pub timeout_ms: u64,
    /// Attempts before giving up with no reply.
    pub retries: u32,
    /// Codec used by RPC proxies.
    pub codec: Codec,
    /// Log every message at info level.
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2500,
            retries: 3,
            codec: Codec::Json,
            verbose: false,
        }
    }
}

impl ClientConfig {
    /// Builder: set per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder: set attempt budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Builder: set the RPC codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Builder: set verbose message logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Worker agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interval between worker heartbeats; also the receive timeout.
    pub heartbeat_interval_ms: u64,
    /// Silent intervals before the broker is presumed gone.
    pub heartbeat_liveness: u32,
    /// Wait before reconnecting.
    pub reconnect_delay_ms: u64,
    /// Log every message at info level.
    pub verbose: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2500,
            heartbeat_liveness: 3,
            reconnect_delay_ms: 2500,
            verbose: false,
        }
    }
}

impl WorkerConfig {
    /// Builder: set heartbeat interval and liveness.
    pub fn with_heartbeat(mut self, interval: Duration, liveness: u32) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self.heartbeat_liveness = liveness;
        self
    }

    /// Builder: set reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Builder: set verbose message logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
