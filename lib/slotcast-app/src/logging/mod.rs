//! Logging.

use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by the directives in `log_level`, and written to standard output either in a human-readable
/// format or, if `log_format_json` is set, as JSON.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), anyhow::Error> {
    let filter_layer = config.log_level.as_env_filter();

    tracing_subscriber::registry()
        .with(build_formatting_layer(config, std::io::stdout).with_filter(filter_layer))
        .try_init()?;

    Ok(())
}
