//! Broker configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Default endpoint a broker binds when none is configured.
pub const DEFAULT_ENDPOINT: &str = "tcp://*:5555";

/// Broker configuration.
///
/// Loaded from TOML with every field optional:
///
/// ```toml
/// name = "main"
/// endpoints = ["tcp://*:5555", "ipc:///run/rock/broker.sock"]
/// heartbeat_interval_ms = 2500
/// heartbeat_liveness = 3
/// verbose = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker name, attached to every log line.
    pub name: String,

    /// Endpoints to bind. Clients and workers may share one.
    pub endpoints: Vec<String>,

    /// Interval between purge ticks and broker heartbeats.
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a worker is considered dead.
    pub heartbeat_liveness: u32,

    /// Outbound messages buffered per peer before new ones are dropped.
    pub peer_queue_depth: usize,

    /// Whether to remove a stale ipc socket file on bind.
    pub cleanup_stale_socket: bool,

    /// Log every routed message at info level.
    pub verbose: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            heartbeat_interval_ms: 2500,
            heartbeat_liveness: 3,
            peer_queue_depth: 1000,
            cleanup_stale_socket: true,
            verbose: false,
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration with the given broker name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: replace the endpoint list with a single endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints = vec![endpoint.into()];
        self
    }

    /// Builder: set heartbeat interval and liveness multiplier.
    pub fn with_heartbeat(mut self, interval: Duration, liveness: u32) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self.heartbeat_liveness = liveness;
        self
    }

    /// Builder: set per-peer outbound queue depth.
    pub fn with_peer_queue_depth(mut self, depth: usize) -> Self {
        self.peer_queue_depth = depth;
        self
    }

    /// Builder: set verbose message logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Builder: set stale socket cleanup.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Interval between purge ticks.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence tolerated before a worker is purged: interval × liveness.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_liveness
    }

    /// Checks values the routing loop relies on.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(BrokerError::config("heartbeat_interval_ms must be positive"));
        }
        if self.heartbeat_liveness == 0 {
            return Err(BrokerError::config("heartbeat_liveness must be positive"));
        }
        if self.peer_queue_depth == 0 {
            return Err(BrokerError::config("peer_queue_depth must be positive"));
        }
        Ok(())
    }

    /// Loads and validates configuration from a TOML file.
    pub fn load_from(path: &Path) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            BrokerError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rock")
            .join("broker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.endpoints, vec![DEFAULT_ENDPOINT.to_string()]);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2500));
        assert_eq!(config.liveness_window(), Duration::from_millis(7500));
        assert!(!config.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = BrokerConfig::new("edge")
            .with_endpoint("ipc:///tmp/edge.sock")
            .with_heartbeat(Duration::from_millis(100), 5)
            .with_peer_queue_depth(10)
            .with_verbose(true)
            .with_cleanup_stale_socket(false);

        assert_eq!(config.name, "edge");
        assert_eq!(config.endpoints, vec!["ipc:///tmp/edge.sock".to_string()]);
        assert_eq!(config.liveness_window(), Duration::from_millis(500));
        assert_eq!(config.peer_queue_depth, 10);
        assert!(config.verbose);
        assert!(!config.cleanup_stale_socket);
    }

    #[test]
    fn load_partial_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(
            &path,
            "name = \"main\"\nendpoints = [\"tcp://*:6000\", \"tcp://*:6001\"]\nheartbeat_liveness = 5\n",
        )
        .unwrap();

        let config = BrokerConfig::load_from(&path).unwrap();
        assert_eq!(config.name, "main");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.heartbeat_liveness, 5);
        assert_eq!(config.heartbeat_interval_ms, 2500);
    }

    #[test]
    fn load_rejects_zero_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(&path, "heartbeat_interval_ms = 0\n").unwrap();

        let result = BrokerConfig::load_from(&path);
        assert!(matches!(result, Err(BrokerError::Config { .. })));
    }

    #[test]
    fn load_missing_file() {
        let result = BrokerConfig::load_from(Path::new("/nonexistent/rock/broker.toml"));
        assert!(matches!(result, Err(BrokerError::Config { .. })));
    }
}
