//! State store abstractions.
//!
//! The engine reaches counters and configuration only through these traits,
//! so a shared, atomically-updatable store can stand in for the in-memory
//! implementations when several instances serve the same keys.

mod counter;
mod memory;

pub use counter::UsageCounters;
pub use memory::{MemoryConfigStore, MemoryCounterStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{Ceilings, Granularity, LimitConfig, UsageKey};
use crate::error::Result;

/// Current-bucket usage for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub per_second: u64,
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
    pub concurrent: u64,
}

impl UsageSnapshot {
    pub fn window(&self, granularity: Granularity) -> u64 {
        match granularity {
            Granularity::Second => self.per_second,
            Granularity::Minute => self.per_minute,
            Granularity::Hour => self.per_hour,
            Granularity::Day => self.per_day,
        }
    }

    pub fn set_window(&mut self, granularity: Granularity, value: u64) {
        match granularity {
            Granularity::Second => self.per_second = value,
            Granularity::Minute => self.per_minute = value,
            Granularity::Hour => self.per_hour = value,
            Granularity::Day => self.per_day = value,
        }
    }
}

/// Ceilings a request would break.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations {
    pub windows: Vec<Granularity>,
    pub concurrent: bool,
}

impl Violations {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && !self.concurrent
    }
}

/// Result of a conditional increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Every ceiling held; usage was recorded. Carries usage after the commit.
    Committed(UsageSnapshot),
    /// At least one ceiling would break; nothing was recorded.
    Rejected {
        usage: UsageSnapshot,
        violations: Violations,
    },
}

/// Storage for per-key usage counters.
///
/// `record_if_within` must be atomic per key: two concurrent calls for the
/// same key can never both pass the check before either commits.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Unconditionally add `weight` at `now`.
    async fn record_usage(&self, key: &UsageKey, weight: u64, now: DateTime<Utc>) -> Result<()>;

    /// Current-bucket usage without mutation.
    async fn peek_usage(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<UsageSnapshot>;

    /// Check `weight` against `ceilings` and record it only if all hold.
    async fn record_if_within(
        &self,
        key: &UsageKey,
        weight: u64,
        ceilings: &Ceilings,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Release in-flight weight. Returns the gauge after release.
    async fn release(&self, key: &UsageKey, weight: u64) -> Result<u64>;

    /// Drop buckets outside the retention horizon for one key.
    async fn purge_stale(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<usize>;

    /// Purge every key, forgetting keys left idle. Returns buckets removed.
    async fn purge_all(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Forget everything about a key.
    async fn reset(&self, key: &UsageKey) -> Result<()>;
}

/// Storage for per-identifier limit configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &UsageKey) -> Result<Option<LimitConfig>>;

    async fn put(&self, config: LimitConfig) -> Result<()>;

    async fn remove(&self, key: &UsageKey) -> Result<Option<LimitConfig>>;

    async fn len(&self) -> Result<usize>;
}
