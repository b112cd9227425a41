use anyhow::{anyhow, Context as _};
use serde::Deserialize;
use slotcast_config::GenericConfiguration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

fn default_log_level() -> LogLevel {
    LogLevel(DEFAULT_LOG_LEVEL.to_string())
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to write logs as JSON instead of the human-readable format.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_false")]
    pub log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, anyhow::Error> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: default_false(),
        }
    }
}

/// A validated set of log filtering directives.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Builds the filter for these directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated on construction.
        EnvFilter::builder().parse_lossy(&self.0)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(anyhow!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .context("Failed to parse valid log level.")?;

        Ok(Self(value))
    }
}
