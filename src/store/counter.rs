//! Fixed-window usage counters for a single key.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{UsageSnapshot, Violations};
use crate::admission::{Ceilings, Granularity, PerGranularity};

/// Usage tracked for one key: weight per bucket per granularity, plus
/// the weight currently in flight.
///
/// Not synchronized; the owning store serializes access per key.
#[derive(Debug, Default, Clone)]
pub struct UsageCounters {
    /// Bucket index -> accumulated weight, per granularity
    buckets: PerGranularity<BTreeMap<u64, u64>>,
    /// Weight admitted and not yet released
    concurrent_in_flight: u64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `weight` to the current bucket of every granularity and to the
    /// in-flight gauge.
    pub fn record(&mut self, weight: u64, now: DateTime<Utc>) {
        for granularity in Granularity::ALL {
            let bucket = granularity.bucket_index(now);
            *self
                .buckets
                .get_mut(granularity)
                .entry(bucket)
                .or_insert(0) += weight;
        }
        self.concurrent_in_flight = self.concurrent_in_flight.saturating_add(weight);
    }

    /// Current-bucket values without mutation.
    pub fn peek(&self, now: DateTime<Utc>) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot {
            concurrent: self.concurrent_in_flight,
            ..Default::default()
        };
        for granularity in Granularity::ALL {
            let bucket = granularity.bucket_index(now);
            let value = self
                .buckets
                .get_ref(granularity)
                .get(&bucket)
                .copied()
                .unwrap_or(0);
            snapshot.set_window(granularity, value);
        }
        snapshot
    }

    /// Which ceilings adding `weight` at `now` would break.
    pub fn check(&self, weight: u64, ceilings: &Ceilings, now: DateTime<Utc>) -> Violations {
        let usage = self.peek(now);
        let windows = Granularity::ALL
            .into_iter()
            .filter(|g| match ceilings.windows.get(*g) {
                Some(ceiling) => usage.window(*g).saturating_add(weight) > ceiling,
                None => false,
            })
            .collect();
        let concurrent = ceilings
            .concurrent
            .map(|ceiling| usage.concurrent.saturating_add(weight) > ceiling)
            .unwrap_or(false);

        Violations {
            windows,
            concurrent,
        }
    }

    /// Decrement the in-flight gauge, flooring at zero.
    pub fn release(&mut self, weight: u64) -> u64 {
        self.concurrent_in_flight = self.concurrent_in_flight.saturating_sub(weight);
        self.concurrent_in_flight
    }

    /// Drop buckets older than each granularity's retention horizon.
    ///
    /// Returns the number of buckets removed.
    pub fn purge_stale(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for granularity in Granularity::ALL {
            let oldest = granularity.oldest_retained(now);
            let buckets = self.buckets.get_mut(granularity);
            let before = buckets.len();
            *buckets = buckets.split_off(&oldest);
            removed += before - buckets.len();
        }
        removed
    }

    /// Number of buckets held across all granularities.
    pub fn bucket_count(&self) -> usize {
        self.buckets.iter().map(|(_, b)| b.len()).sum()
    }

    /// No buckets and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.concurrent_in_flight == 0 && self.bucket_count() == 0
    }

    pub fn concurrent_in_flight(&self) -> u64 {
        self.concurrent_in_flight
    }
}
