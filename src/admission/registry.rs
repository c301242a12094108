//! Limit configuration registry.
//!
//! Stored per-identifier configs win; everything else falls back to a
//! per-type default synthesized on demand and never written back, so a
//! default can change centrally without touching stored identifiers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::key::{IdentifierType, UsageKey};
use super::limits::{LimitConfig, QueuePolicy, Thresholds};
use super::rules::LimitsFile;
use crate::error::Result;
use crate::queue::Priority;
use crate::store::ConfigStore;

/// Built-in fallback for an identifier type, escalating with trust.
pub fn builtin_default(identifier_type: IdentifierType) -> LimitConfig {
    // (per second, per minute, per hour, per day, concurrent, burst, queue size, max wait secs)
    let (second, minute, hour, day, concurrent, burst, queue_size, max_wait) = match identifier_type {
        IdentifierType::Ip => (5, 60, 1_000, 10_000, 5, 2, 10, 10),
        IdentifierType::User => (10, 300, 5_000, 50_000, 10, 5, 50, 30),
        IdentifierType::ApiKey => (50, 2_000, 50_000, 500_000, 50, 20, 200, 30),
        IdentifierType::Service => (200, 10_000, 250_000, 5_000_000, 200, 50, 1_000, 60),
    };

    LimitConfig {
        identifier: String::new(),
        identifier_type,
        limits: Thresholds {
            per_second: Some(second),
            per_minute: Some(minute),
            per_hour: Some(hour),
            per_day: Some(day),
            concurrent: Some(concurrent),
        },
        burst_allowance: burst,
        queue_policy: QueuePolicy {
            enabled: true,
            max_queue_size: queue_size,
            max_wait: Duration::from_secs(max_wait),
        },
        priority: Priority::Normal,
    }
}

/// Registry of stored limit configs and per-type defaults.
pub struct LimitRegistry {
    store: Arc<dyn ConfigStore>,
    defaults: RwLock<HashMap<IdentifierType, LimitConfig>>,
}

impl LimitRegistry {
    /// Create a registry pre-populated with the built-in defaults.
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        let defaults = IdentifierType::ALL
            .into_iter()
            .map(|ty| (ty, builtin_default(ty)))
            .collect();
        Self {
            store,
            defaults: RwLock::new(defaults),
        }
    }

    /// Validate and upsert a per-identifier config.
    pub async fn set_config(&self, config: LimitConfig) -> Result<()> {
        config.validate()?;
        debug!(key = %config.key(), limits = ?config.limits, "Storing limit config");
        self.store.put(config).await
    }

    /// The stored config for a key, if any. Defaults are not returned here.
    pub async fn get_config(&self, key: &UsageKey) -> Result<Option<LimitConfig>> {
        self.store.get(key).await
    }

    /// The fallback for an identifier type, with an empty identifier.
    pub fn get_default(&self, identifier_type: IdentifierType) -> LimitConfig {
        self.defaults
            .read()
            .get(&identifier_type)
            .cloned()
            .unwrap_or_else(|| builtin_default(identifier_type))
    }

    /// Replace the default used for every unconfigured identifier of a type.
    pub fn set_default(&self, mut config: LimitConfig) -> Result<()> {
        config.identifier = "default".to_string();
        config.validate()?;
        config.identifier.clear();
        info!(identifier_type = %config.identifier_type, "Replacing default limits");
        self.defaults.write().insert(config.identifier_type, config);
        Ok(())
    }

    /// The config that applies to a key: stored, else the type default
    /// stamped with the key's identifier (not persisted).
    pub async fn resolve(&self, key: &UsageKey) -> Result<LimitConfig> {
        if let Some(config) = self.store.get(key).await? {
            return Ok(config);
        }
        let mut config = self.get_default(key.identifier_type);
        config.identifier = key.identifier.clone();
        Ok(config)
    }

    /// Load defaults and per-identifier configs from a seed file.
    pub async fn seed(&self, file: LimitsFile) -> Result<usize> {
        for (_, config) in file.defaults {
            self.set_default(config)?;
        }
        let count = file.limits.len();
        for config in file.limits {
            self.set_config(config).await?;
        }
        info!(configs = count, "Seeded limit configs");
        Ok(count)
    }
}
