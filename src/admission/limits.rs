//! Limit configuration: thresholds, burst allowance and queue policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::{IdentifierType, UsageKey};
use super::window::{Granularity, PerGranularity};
use crate::error::{AdmissionError, Result};
use crate::queue::Priority;

/// Thresholds per granularity. `None` means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u64>,
    /// Maximum weight in flight at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent: Option<u64>,
}

impl Thresholds {
    /// The threshold configured for a rate granularity.
    pub fn window(&self, granularity: Granularity) -> Option<u64> {
        match granularity {
            Granularity::Second => self.per_second,
            Granularity::Minute => self.per_minute,
            Granularity::Hour => self.per_hour,
            Granularity::Day => self.per_day,
        }
    }

    /// Granularities that carry a threshold.
    pub fn configured(&self) -> impl Iterator<Item = Granularity> + '_ {
        Granularity::ALL
            .into_iter()
            .filter(|g| self.window(*g).is_some())
    }

    fn validate(&self) -> Result<()> {
        for granularity in Granularity::ALL {
            if self.window(granularity) == Some(0) {
                return Err(AdmissionError::validation(format!(
                    "per-{} threshold must be a positive integer",
                    granularity
                )));
            }
        }
        if self.concurrent == Some(0) {
            return Err(AdmissionError::validation(
                "concurrent threshold must be a positive integer",
            ));
        }
        Ok(())
    }
}

/// Whether and how denied requests may wait for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePolicy {
    #[serde(default = "default_queue_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(
        rename = "maxWaitMs",
        with = "crate::serde_ms",
        default = "default_max_wait"
    )]
    pub max_wait: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            enabled: default_queue_enabled(),
            max_queue_size: default_max_queue_size(),
            max_wait: default_max_wait(),
        }
    }
}

fn default_queue_enabled() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_wait() -> Duration {
    Duration::from_secs(30)
}

/// Limits applied to one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    #[serde(default)]
    pub limits: Thresholds,
    /// Extra units tolerated above every rate threshold.
    #[serde(default)]
    pub burst_allowance: u64,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    /// Priority given to queued requests that do not name one.
    #[serde(default)]
    pub priority: Priority,
}

impl LimitConfig {
    /// The key this configuration applies to.
    pub fn key(&self) -> UsageKey {
        UsageKey::new(self.identifier.clone(), self.identifier_type)
    }

    /// Check every invariant a stored configuration must hold.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(AdmissionError::validation("identifier is required"));
        }
        self.limits.validate()?;
        if self.queue_policy.enabled {
            if self.queue_policy.max_queue_size == 0 {
                return Err(AdmissionError::validation(
                    "queuePolicy.maxQueueSize must be positive when queueing is enabled",
                ));
            }
            if self.queue_policy.max_wait.is_zero() {
                return Err(AdmissionError::validation(
                    "queuePolicy.maxWaitMs must be positive when queueing is enabled",
                ));
            }
        }
        Ok(())
    }

    /// The hard caps a request is checked against, burst included.
    pub fn ceilings(&self) -> Ceilings {
        let mut windows = PerGranularity::default();
        for granularity in Granularity::ALL {
            let ceiling = self
                .limits
                .window(granularity)
                .map(|t| t.saturating_add(self.burst_allowance));
            windows.set(granularity, ceiling);
        }
        Ceilings {
            windows,
            concurrent: self.limits.concurrent,
        }
    }
}

/// Effective caps handed to the counter store for a conditional increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ceilings {
    pub windows: PerGranularity<Option<u64>>,
    pub concurrent: Option<u64>,
}
