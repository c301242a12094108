//! In-process store implementations backed by `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{ConfigStore, CounterStore, Reservation, UsageCounters, UsageSnapshot};
use crate::admission::{Ceilings, LimitConfig, UsageKey};
use crate::error::Result;

/// Counters held in process memory.
///
/// Every mutation of a key runs under that key's shard write lock, which
/// makes `record_if_within` a single critical section per key.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<UsageKey, UsageCounters>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with live counters.
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_usage(&self, key: &UsageKey, weight: u64, now: DateTime<Utc>) -> Result<()> {
        self.counters
            .entry(key.clone())
            .or_default()
            .record(weight, now);
        Ok(())
    }

    async fn peek_usage(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        Ok(self
            .counters
            .get(key)
            .map(|c| c.peek(now))
            .unwrap_or_default())
    }

    async fn record_if_within(
        &self,
        key: &UsageKey,
        weight: u64,
        ceilings: &Ceilings,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut counters = self.counters.entry(key.clone()).or_default();

        let violations = counters.check(weight, ceilings, now);
        if !violations.is_empty() {
            trace!(key = %key, weight = weight, ?violations, "Conditional increment rejected");
            return Ok(Reservation::Rejected {
                usage: counters.peek(now),
                violations,
            });
        }

        counters.record(weight, now);
        Ok(Reservation::Committed(counters.peek(now)))
    }

    async fn release(&self, key: &UsageKey, weight: u64) -> Result<u64> {
        Ok(self
            .counters
            .get_mut(key)
            .map(|mut c| c.release(weight))
            .unwrap_or(0))
    }

    async fn purge_stale(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .counters
            .get_mut(key)
            .map(|mut c| c.purge_stale(now))
            .unwrap_or(0))
    }

    async fn purge_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        self.counters.retain(|_, counters| {
            removed += counters.purge_stale(now);
            !counters.is_idle()
        });
        if removed > 0 {
            debug!(buckets = removed, keys = self.counters.len(), "Purged stale buckets");
        }
        Ok(removed)
    }

    async fn reset(&self, key: &UsageKey) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }
}

/// Configuration held in process memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: DashMap<UsageKey, LimitConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &UsageKey) -> Result<Option<LimitConfig>> {
        Ok(self.configs.get(key).map(|c| c.clone()))
    }

    async fn put(&self, config: LimitConfig) -> Result<()> {
        self.configs.insert(config.key(), config);
        Ok(())
    }

    async fn remove(&self, key: &UsageKey) -> Result<Option<LimitConfig>> {
        Ok(self.configs.remove(key).map(|(_, c)| c))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.configs.len())
    }
}
