//! Configuration loader with layered sources.

use crate::{ConfigValidator, HopperConfig};
use config::{Config, ConfigError, Environment, File};
use hopper_core::HopperError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<HopperConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `HOPPER_` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, HopperError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, HopperError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> HopperConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// Queue catalogue changes only take effect for components built after
    /// the reload; running workers keep the catalogue they started with.
    pub async fn reload(&self) -> Result<(), HopperError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<HopperConfig, HopperError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("HOPPER_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HOPPER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_hopper_error)?;

        let hopper_config: HopperConfig = config
            .try_deserialize()
            .map_err(config_error_to_hopper_error)?;

        validate(&hopper_config)?;

        Ok(hopper_config)
    }
}

/// Validates a configuration, folding every problem into one error.
pub fn validate(config: &HopperConfig) -> Result<(), HopperError> {
    ConfigValidator::validate(config).map_err(|errors| {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        HopperError::Configuration(message)
    })
}

fn config_error_to_hopper_error(err: ConfigError) -> HopperError {
    HopperError::Configuration(err.to_string())
}
