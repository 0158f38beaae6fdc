//! # Configuration
//!
//! Optional overrides for logging and transfer behaviour, loaded from TOML.
//! Every field has a default, so an empty file is a valid configuration and
//! backends fall back to their model constants when an override is unset.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::LogLevel;
use crate::error::ConfigError;

/// Upper bound for a configured retry count.
pub const MAX_CONFIGURED_RETRIES: u32 = 16;

/// Library configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Wire transfer overrides
    pub transfer: TransferConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level forwarded to the context's log sink
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Warning,
        }
    }
}

/// Transfer overrides applied on top of each model's constants.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Stream timeout in milliseconds (-1 blocks, 0 is non-blocking)
    pub timeout_ms: Option<i32>,
    /// Retries per packet exchange
    pub max_retries: Option<u32>,
    /// Pause before a retry, in milliseconds
    pub retry_delay_ms: Option<u32>,
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the given path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    /// or invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load_from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "using default configuration"
                );
                Self::default()
            }
        }
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(timeout) = self.transfer.timeout_ms {
            if timeout < -1 {
                return Err(ConfigError::Invalid {
                    key: "transfer.timeout_ms",
                    message: format!("{timeout} is neither -1 nor a non-negative duration"),
                });
            }
        }
        if let Some(retries) = self.transfer.max_retries {
            if retries > MAX_CONFIGURED_RETRIES {
                return Err(ConfigError::Invalid {
                    key: "transfer.max_retries",
                    message: format!("{retries} exceeds {MAX_CONFIGURED_RETRIES}"),
                });
            }
        }
        Ok(())
    }
}
