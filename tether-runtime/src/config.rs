//! Bridge Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TETHER_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TETHER_INITIAL_SLOTS` | Slots reserved up front | 64 |
//! | `TETHER_MAX_SLOTS` | Hard limit on table slots (at most 2^20) | 1048576 |
//! | `TETHER_DEDUP_DEREF` | Reuse deref handles per (object, layout) ("true"/"false") | true |
//! | `TETHER_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use tether_runtime::config::BridgeConfig;
//!
//! // Load from environment with defaults
//! let config = BridgeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = BridgeConfig::builder()
//!     .max_slots(4096)
//!     .dedup_deref(false)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_slots, 4096);
//! ```

use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::tag::MAX_SLOTS;

/// Log level for bridge logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::EnvParseError {
                var: "log level".into(),
                message: format!("unknown level '{s}'"),
            }),
        }
    }
}

/// Handle bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Slots reserved when the table is created.
    /// Default: 64.
    pub initial_slots: usize,

    /// Maximum number of slots the table may create.
    /// Default: 2^20, the most a handle word can address.
    pub max_slots: u32,

    /// Return the existing deref handle when one is live for the same object
    /// and layout. When disabled every `create_deref` mints a new entry.
    /// Default: true.
    pub dedup_deref: bool,

    /// Minimum level for bridge log output.
    /// Default: info.
    pub log_level: LogLevel,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_slots: 64,
            max_slots: MAX_SLOTS,
            dedup_deref: true,
            log_level: LogLevel::Info,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("TETHER_INITIAL_SLOTS") {
            config.initial_slots = val;
        }

        if let Some(val) = parse_env_usize("TETHER_MAX_SLOTS") {
            if val > 0 && val <= MAX_SLOTS as usize {
                config.max_slots = val as u32;
            }
        }

        if let Some(val) = parse_env_bool("TETHER_DEDUP_DEREF") {
            config.dedup_deref = val;
        }

        if let Ok(val) = env::var("TETHER_LOG_LEVEL") {
            if let Ok(level) = val.parse() {
                config.log_level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_slots == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_slots".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.max_slots > MAX_SLOTS {
            return Err(ConfigError::InvalidValue {
                field: "max_slots".into(),
                message: format!("must be at most {MAX_SLOTS}"),
            });
        }

        if self.initial_slots > self.max_slots as usize {
            return Err(ConfigError::InvalidValue {
                field: "initial_slots".into(),
                message: "must not exceed max_slots".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for BridgeConfig.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of slots reserved up front.
    pub fn initial_slots(mut self, n: usize) -> Self {
        self.config.initial_slots = n;
        self
    }

    /// Set the slot limit.
    pub fn max_slots(mut self, n: u32) -> Self {
        self.config.max_slots = n;
        self
    }

    /// Enable or disable deref handle deduplication.
    pub fn dedup_deref(mut self, enabled: bool) -> Self {
        self.config.dedup_deref = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}
