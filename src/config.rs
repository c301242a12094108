//! Configuration management for the admission control service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{AdmissionError, Result};

/// Prefix for environment overrides, e.g. `ADMISSION__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Optional YAML file of default and per-identifier limits
    #[serde(default)]
    pub limits_path: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the drain scheduler runs, in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,

    /// Assumed service time per queue position, in milliseconds
    #[serde(default = "default_average_service")]
    pub average_service_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval(),
            average_service_ms: default_average_service(),
        }
    }
}

fn default_drain_interval() -> u64 {
    1000
}

fn default_average_service() -> u64 {
    100
}

impl EngineConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn average_service(&self) -> Duration {
        Duration::from_millis(self.average_service_ms)
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_yaml::from_str(&contents)
            .map_err(|e| AdmissionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional config file (format taken from its extension)
    /// under `ADMISSION__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(Path::new(path)));
        }
        let config: ServiceConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.drain_interval_ms == 0 {
            return Err(AdmissionError::Config(
                "engine.drain_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
