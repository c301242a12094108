//! Admission and queue statistics.
//!
//! The aggregator only consumes events raised by the engine, the queue
//! front end and the drain scheduler; it never influences a decision.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::admission::{IdentifierType, UsageKey};

/// Something that happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// A live check was allowed.
    Allowed,
    /// A live check was denied.
    Blocked,
    /// A request entered a wait queue.
    Queued,
    /// An enqueue was refused because the queue was full.
    QueueRejected,
    /// A queued request was admitted by the drain scheduler.
    Dequeued,
    /// A queued request waited past its deadline.
    Expired,
    /// A queued request was withdrawn by its caller.
    Cancelled,
    /// A queued request could not be evaluated.
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    blocked: AtomicU64,
    queued: AtomicU64,
    queue_rejected: AtomicU64,
    dequeued: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(&self, event: MetricEvent) {
        let counter = match event {
            MetricEvent::Allowed => &self.allowed,
            MetricEvent::Blocked => &self.blocked,
            MetricEvent::Queued => &self.queued,
            MetricEvent::QueueRejected => &self.queue_rejected,
            MetricEvent::Dequeued => &self.dequeued,
            MetricEvent::Expired => &self.expired,
            MetricEvent::Cancelled => &self.cancelled,
            MetricEvent::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub allowed: u64,
    pub blocked: u64,
    pub queued: u64,
    pub queue_rejected: u64,
    pub dequeued: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl CounterSnapshot {
    /// Live checks seen, allowed or not.
    pub fn checks(&self) -> u64 {
        self.allowed + self.blocked
    }
}

/// Statistics for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierStats {
    #[serde(flatten)]
    pub key: UsageKey,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

/// Aggregate plus per-identifier statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub totals: CounterSnapshot,
    pub identifiers: Vec<IdentifierStats>,
    /// Events counted in the totals only, because the per-identifier table
    /// was full when they arrived.
    #[serde(default)]
    pub untracked_events: u64,
}

/// Which identifiers a snapshot should include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsFilter {
    pub identifier: Option<String>,
    pub identifier_type: Option<IdentifierType>,
}

impl MetricsFilter {
    fn matches(&self, key: &UsageKey) -> bool {
        self.identifier
            .as_deref()
            .map_or(true, |id| id == key.identifier)
            && self
                .identifier_type
                .map_or(true, |ty| ty == key.identifier_type)
    }
}

/// Per-identifier stats stop being kept after this long without an event.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Most identifiers tracked individually at once.
pub const DEFAULT_MAX_IDENTIFIERS: usize = 10_000;

#[derive(Debug, Default)]
struct KeyStats {
    counters: Counters,
    last_seen_ms: AtomicI64,
}

impl KeyStats {
    fn bump(&self, event: MetricEvent, now: DateTime<Utc>) {
        self.counters.bump(event);
        self.last_seen_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }
}

/// Accumulates counts of admission and queue events.
///
/// Totals are kept forever. Per-identifier stats are bounded: identifiers
/// idle longer than `idle_ttl` are dropped by [`purge_idle`](Self::purge_idle),
/// and once `max_identifiers` are tracked, events for new identifiers only
/// reach the totals.
#[derive(Debug)]
pub struct MetricsAggregator {
    totals: Counters,
    per_key: DashMap<UsageKey, KeyStats>,
    untracked: AtomicU64,
    idle_ttl: Duration,
    max_identifiers: usize,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::with_limits(DEFAULT_IDLE_TTL, DEFAULT_MAX_IDENTIFIERS)
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(idle_ttl: Duration, max_identifiers: usize) -> Self {
        Self {
            totals: Counters::default(),
            per_key: DashMap::new(),
            untracked: AtomicU64::new(0),
            idle_ttl,
            max_identifiers,
        }
    }

    /// Count an event against the totals and the key.
    pub fn record(&self, key: &UsageKey, event: MetricEvent, now: DateTime<Utc>) {
        self.totals.bump(event);
        if let Some(stats) = self.per_key.get(key) {
            stats.bump(event, now);
            return;
        }
        if self.per_key.len() >= self.max_identifiers {
            self.untracked.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.per_key.entry(key.clone()).or_default().bump(event, now);
    }

    /// Drop per-identifier stats with no event within the idle TTL.
    ///
    /// Returns the number of identifiers dropped.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let idle_ms = i64::try_from(self.idle_ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp_millis().saturating_sub(idle_ms);
        let before = self.per_key.len();
        self.per_key
            .retain(|_, stats| stats.last_seen_ms.load(Ordering::Relaxed) > cutoff);
        let removed = before.saturating_sub(self.per_key.len());
        if removed > 0 {
            debug!(identifiers = removed, "Dropped idle identifier stats");
        }
        removed
    }

    /// Drop a single identifier's stats. Totals are untouched.
    pub fn forget(&self, key: &UsageKey) -> bool {
        self.per_key.remove(key).is_some()
    }

    /// Identifiers currently tracked individually.
    pub fn tracked_identifiers(&self) -> usize {
        self.per_key.len()
    }

    /// Totals across every identifier, plus the identifiers matching `filter`
    /// sorted by key.
    pub fn snapshot(&self, filter: &MetricsFilter) -> MetricsSnapshot {
        let mut identifiers: Vec<IdentifierStats> = self
            .per_key
            .iter()
            .filter(|entry| filter.matches(entry.key()))
            .map(|entry| IdentifierStats {
                key: entry.key().clone(),
                counters: entry.value().counters.snapshot(),
            })
            .collect();
        identifiers.sort_by(|a, b| a.key.to_string_key().cmp(&b.key.to_string_key()));

        MetricsSnapshot {
            totals: self.totals.snapshot(),
            identifiers,
            untracked_events: self.untracked.load(Ordering::Relaxed),
        }
    }

    /// Counters for a single key, if it has seen any event.
    pub fn for_key(&self, key: &UsageKey) -> Option<CounterSnapshot> {
        self.per_key.get(key).map(|s| s.counters.snapshot())
    }
}
