//! Application configuration
//!
//! Loaded from an optional `config.toml` and `EDGERPC_`-prefixed environment
//! variables, e.g. `EDGERPC_CACHE__MAX_ENTRY_COUNT=500`.

mod cache;

use application::error::ApplicationError;
use serde::{Deserialize, Serialize};

pub use cache::ResponseCacheConfig;

use crate::telemetry::TelemetryConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "EDGERPC";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Response cache configuration
    #[serde(default)]
    pub cache: ResponseCacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load configuration from environment and optional file
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so field names keep theirs
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ApplicationError> {
        self.cache.validate()?;
        if self.telemetry.log_filter.trim().is_empty() {
            return Err(ApplicationError::Configuration(
                "telemetry.log_filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
