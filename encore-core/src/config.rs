//! Configuration types for the Encore engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EncoreError, Result};
use crate::retry::RetryPolicy;

/// Main configuration for the Encore engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EncoreConfig {
    /// Default retry policy for steps
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Event log configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Event log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// JSON-lines file to persist events to. Events stay in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Builder for EncoreConfig
#[derive(Default)]
pub struct ConfigBuilder {
    config: EncoreConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Persist events to a file
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log.path = Some(path.into());
        self
    }

    pub fn build(self) -> EncoreConfig {
        self.config
    }
}

impl EncoreConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `encore.toml` in the working directory
    /// 3. The file named by `ENCORE_CONFIG_PATH`
    /// 4. `ENCORE_` environment variables, nested with `__`
    ///    (e.g. `ENCORE_RETRY__MAX_ATTEMPTS=5`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(EncoreConfig::default()))
            .merge(Toml::file("encore.toml"));

        if let Ok(path) = std::env::var("ENCORE_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: EncoreConfig = figment
            .merge(Env::prefixed("ENCORE_").ignore(&["config_path"]).split("__"))
            .extract()
            .map_err(|e| {
                EncoreError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: EncoreConfig = Figment::from(Serialized::defaults(EncoreConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                EncoreError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the retry policy cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(EncoreError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EncoreError::Configuration(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        Ok(())
    }
}
