//! Logging subsystem for notevault
//!
//! Structured logging through `tracing`. Output goes to stderr so commands
//! that print data on stdout stay pipeable. `RUST_LOG`, when set, overrides
//! the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The minimum log level to display
    pub level: LogLevel,
    /// Whether to include timestamps
    pub with_timestamp: bool,
    /// Whether to include target module information
    pub with_target: bool,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of the application config
    pub fn from_config(config: &LoggingConfig) -> Result<Self, LoggingError> {
        Ok(Self {
            level: config.level.parse()?,
            with_timestamp: true,
            with_target: config.with_target,
            json_format: config.json_format,
        })
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Filter directive: our crates at the configured level, dependencies at warn
    pub fn filter_directive(&self) -> String {
        let level = self.level.as_str();
        format!("warn,notevault_core={level},notevault={level}", level = level)
    }
}

/// Initialize the logging subsystem with default configuration
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize the logging subsystem with custom configuration
///
/// # Example
/// ```
/// use notevault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug)
///     .with_timestamp(false)
///     .with_target(false);
///
/// init_logging_with_config(config).expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directive())
            .map_err(|e| LoggingError::InvalidConfiguration(e.to_string()))?,
    };

    let target = config.with_target;
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> =
        match (config.json_format, config.with_timestamp) {
            (true, true) => fmt::layer()
                .json()
                .with_target(target)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => fmt::layer()
                .json()
                .without_time()
                .with_target(target)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, true) => fmt::layer()
                .with_target(target)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => fmt::layer()
                .without_time()
                .with_target(target)
                .with_writer(std::io::stderr)
                .boxed(),
        };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.with_timestamp);
        assert!(config.with_target);
        assert!(!config.json_format);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new(LogLevel::Debug)
            .with_timestamp(false)
            .with_target(false)
            .json_format(true);

        assert_eq!(config.level, LogLevel::Debug);
        assert!(!config.with_timestamp);
        assert!(!config.with_target);
        assert!(config.json_format);
    }

    #[test]
    fn test_from_app_config() {
        let app = LoggingConfig {
            level: "debug".to_string(),
            json_format: true,
            with_target: false,
        };
        let config = LogConfig::from_config(&app).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.json_format);

        let bad = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(LogConfig::from_config(&bad).is_err());
    }

    #[test]
    fn test_filter_directive_scopes_crates() {
        let directive = LogConfig::new(LogLevel::Trace).filter_directive();
        assert_eq!(directive, "warn,notevault_core=trace,notevault=trace");
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}
