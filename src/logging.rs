//! Structured logging using the tracing crate.
//!
//! Supports pretty, compact and JSON output on stderr. `RUST_LOG` takes
//! precedence over any configured level or filter directive.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Builder for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    level: String,
    format: LogFormat,
    ansi_colors: bool,
    with_target: bool,
    filter: Option<String>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi_colors: true,
            with_target: false,
            filter: None,
        }
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from the `[logging]` config section.
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self::default()
            .with_level(config.level.clone())
            .with_format(config.format)
    }

    /// Set the log level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi_colors = enabled;
        self
    }

    /// Include target in logs.
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Set filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let directive = self.filter.as_deref().unwrap_or(&self.level);
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(directive))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Install the global subscriber.
    pub fn init(self) -> Result<()> {
        let env_filter = self.build_filter();
        let registry = tracing_subscriber::registry().with(env_filter);

        let result = match self.format {
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr)
                        .with_ansi(self.ansi_colors)
                        .with_target(self.with_target),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr)
                        .with_ansi(self.ansi_colors)
                        .with_target(self.with_target),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_current_span(true)
                        .with_target(self.with_target),
                )
                .try_init(),
        };

        result.map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_from_config() {
        let config = LoggingConfig {
            level: "debug".into(),
            format: LogFormat::Json,
        };
        let builder = LoggingBuilder::from_config(&config).with_ansi(false);
        assert_eq!(builder.level, "debug");
        assert_eq!(builder.format, LogFormat::Json);
        assert!(!builder.ansi_colors);
    }

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(format, LogFormat::Pretty);
    }
}
