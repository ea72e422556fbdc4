//! Tracing setup shared by the broker, worker services and the CLI.
//!
//! Only binaries install a subscriber. Library crates emit events through
//! `tracing` and take their component name and verbosity from their own
//! configuration objects.
//!
//! ```ignore
//! use rock_core::tracing::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::daemon())?;
//! ```

use std::str::FromStr;

use thiserror::Error;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

/// Environment variable selecting the daemon log format.
pub const LOG_FORMAT_ENV: &str = "ROCK_LOG_FORMAT";

/// Crates whose events are enabled by the default filter.
const ROCK_TARGETS: &[&str] = &[
    "rock_core",
    "rock_protocol",
    "rock_broker",
    "rock_client",
    "rock_service",
];

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to parse env filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("unknown log format {0:?} (expected pretty, compact or json)")]
    UnknownFormat(String),
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// One JSON object per line, for supervisors and log shippers.
    Json,
}

impl FromStr for TracingOutputFormat {
    type Err = TracingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(TracingError::UnknownFormat(s.to_string())),
        }
    }
}

/// Subscriber settings chosen by a binary.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level for the rock crates when `RUST_LOG` is unset.
    pub default_level: Level,
    pub output_format: TracingOutputFormat,
    /// File and line of each event.
    pub include_location: bool,
    pub include_target: bool,
    /// Only honoured by the compact format.
    pub include_timestamp: bool,
    /// Log span open/close, e.g. the `broker` and `service` run spans.
    pub include_span_events: bool,
    /// Overrides both `RUST_LOG` and `default_level`.
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            output_format: TracingOutputFormat::Compact,
            include_location: false,
            include_target: true,
            include_timestamp: true,
            include_span_events: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    /// Interactive CLI use: quiet unless `debug`, no timestamps.
    #[must_use]
    pub fn cli(debug: bool) -> Self {
        Self {
            default_level: if debug { Level::DEBUG } else { Level::WARN },
            include_location: debug,
            include_target: debug,
            include_timestamp: false,
            ..Self::default()
        }
    }

    /// Long-running broker and service processes.
    ///
    /// The format comes from `ROCK_LOG_FORMAT` when it holds a valid name.
    #[must_use]
    pub fn daemon() -> Self {
        let output_format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        Self {
            output_format,
            include_location: true,
            include_span_events: output_format == TracingOutputFormat::Json,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Filter directive enabling every rock crate at the default level.
    pub fn default_directives(&self) -> String {
        ROCK_TARGETS
            .iter()
            .map(|target| format!("{target}={}", self.default_level))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        let filter = match &self.env_filter {
            Some(directive) => EnvFilter::try_new(directive)?,
            None => EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(self.default_directives()))?,
        };
        Ok(filter)
    }

    fn fmt_layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let span_events = if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target)
            .with_span_events(span_events);

        match self.output_format {
            TracingOutputFormat::Pretty => layer.pretty().boxed(),
            TracingOutputFormat::Json => layer.json().boxed(),
            TracingOutputFormat::Compact if self.include_timestamp => layer.compact().boxed(),
            TracingOutputFormat::Compact => layer.compact().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the filter does not parse.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let subscriber = tracing_subscriber::registry()
        .with(config.filter()?)
        .with(config.fmt_layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_levels() {
        assert_eq!(TracingConfig::cli(true).default_level, Level::DEBUG);
        assert_eq!(TracingConfig::cli(false).default_level, Level::WARN);
        assert!(!TracingConfig::cli(false).include_timestamp);
        assert_eq!(
            TracingConfig::cli(false).output_format,
            TracingOutputFormat::Compact
        );
    }

    #[test]
    fn format_names() {
        assert_eq!("json".parse::<TracingOutputFormat>().unwrap(), TracingOutputFormat::Json);
        assert_eq!(
            " Pretty ".parse::<TracingOutputFormat>().unwrap(),
            TracingOutputFormat::Pretty
        );
        assert!(matches!(
            "logfmt".parse::<TracingOutputFormat>(),
            Err(TracingError::UnknownFormat(name)) if name == "logfmt"
        ));
    }

    #[test]
    fn default_directives_cover_every_crate() {
        let directives = TracingConfig::default()
            .with_level(Level::DEBUG)
            .default_directives();
        assert!(directives.starts_with("rock_core=DEBUG,"));
        assert!(directives.contains("rock_broker=DEBUG"));
        assert!(directives.ends_with("rock_service=DEBUG"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn explicit_filter_wins() {
        let config = TracingConfig::daemon()
            .with_format(TracingOutputFormat::Json)
            .with_env_filter("rock_broker=trace");
        assert_eq!(config.output_format, TracingOutputFormat::Json);
        assert!(config.filter().is_ok());

        let bad = TracingConfig::default().with_env_filter("rock_broker=[");
        assert!(matches!(bad.filter(), Err(TracingError::EnvFilter(_))));
    }
}
