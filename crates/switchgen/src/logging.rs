//! Logging bootstrap for binaries and tests.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use when `RUST_LOG` is unset.
    pub level: Level,
    /// Emit JSON formatted records.
    pub json: bool,
    /// Include file and line information.
    pub file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> LoggingConfig {
        LoggingConfig {
            level,
            ..LoggingConfig::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the config level.
pub fn setup_logging(config: LoggingConfig) {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
