//! Fixed-window granularities and bucket arithmetic.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Time granularity for rate counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Per-second counting
    Second,
    /// Per-minute counting
    Minute,
    /// Per-hour counting
    Hour,
    /// Per-day counting
    Day,
}

impl Granularity {
    /// Every granularity, finest first.
    pub const ALL: [Granularity; 4] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
    ];

    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        match self {
            Granularity::Second => Duration::from_secs(1),
            Granularity::Minute => Duration::from_secs(60),
            Granularity::Hour => Duration::from_secs(3600),
            Granularity::Day => Duration::from_secs(86400),
        }
    }

    fn window_millis(&self) -> u64 {
        self.duration().as_millis() as u64
    }

    /// Number of buckets kept before a bucket is considered stale.
    pub fn retention_buckets(&self) -> u64 {
        match self {
            Granularity::Second => 60,
            Granularity::Minute => 60,
            Granularity::Hour => 24,
            Granularity::Day => 30,
        }
    }

    /// Index of the bucket containing `now`: `floor(now / window)`.
    pub fn bucket_index(&self, now: DateTime<Utc>) -> u64 {
        epoch_millis(now) / self.window_millis()
    }

    /// Oldest bucket index still inside the retention horizon at `now`.
    pub fn oldest_retained(&self, now: DateTime<Utc>) -> u64 {
        self.bucket_index(now)
            .saturating_sub(self.retention_buckets() - 1)
    }

    /// When the bucket containing `now` ends.
    pub fn bucket_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let end_ms = (self.bucket_index(now) + 1) * self.window_millis();
        Utc.timestamp_millis_opt(end_ms as i64)
            .single()
            .unwrap_or(now)
    }

    /// Time left until the bucket containing `now` rolls over.
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        let end_ms = (self.bucket_index(now) + 1) * self.window_millis();
        Duration::from_millis(end_ms - epoch_millis(now))
    }

    fn index(&self) -> usize {
        match self {
            Granularity::Second => 0,
            Granularity::Minute => 1,
            Granularity::Hour => 2,
            Granularity::Day => 3,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        };
        f.write_str(name)
    }
}

/// One value per granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerGranularity<T>([T; 4]);

impl<T: Copy> PerGranularity<T> {
    pub fn get(&self, granularity: Granularity) -> T {
        self.0[granularity.index()]
    }

    pub fn set(&mut self, granularity: Granularity, value: T) {
        self.0[granularity.index()] = value;
    }
}

impl<T> PerGranularity<T> {
    pub fn get_ref(&self, granularity: Granularity) -> &T {
        &self.0[granularity.index()]
    }

    pub fn get_mut(&mut self, granularity: Granularity) -> &mut T {
        &mut self.0[granularity.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Granularity, &T)> {
        Granularity::ALL.into_iter().zip(self.0.iter())
    }
}

fn epoch_millis(now: DateTime<Utc>) -> u64 {
    now.timestamp_millis().max(0) as u64
}
