//! Queue entries, priorities and the statuses reported for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::admission::UsageKey;

/// Scheduling priority of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Rank used for ordering; higher is served first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A request waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub request_id: String,
    #[serde(flatten)]
    pub key: UsageKey,
    pub operation: String,
    pub priority: Priority,
    pub enqueue_time: DateTime<Utc>,
    #[serde(rename = "maxWaitMs", with = "crate::serde_ms")]
    pub max_wait: Duration,
    /// Insertion order within the owning queue; set on enqueue.
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl QueueEntry {
    pub fn new(
        request_id: impl Into<String>,
        key: UsageKey,
        operation: impl Into<String>,
        priority: Priority,
        enqueue_time: DateTime<Utc>,
        max_wait: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            key,
            operation: operation.into(),
            priority,
            enqueue_time,
            max_wait,
            sequence: 0,
        }
    }

    /// Whether the entry has waited at least `max_wait` by `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let waited = now.signed_duration_since(self.enqueue_time);
        match waited.to_std() {
            Ok(waited) => waited >= self.max_wait,
            // now is before enqueue_time
            Err(_) => self.max_wait.is_zero(),
        }
    }

    /// Queue order: priority rank descending, then enqueue time, then insertion order.
    pub(crate) fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .rank()
            .cmp(&self.priority.rank())
            .then_with(|| self.enqueue_time.cmp(&other.enqueue_time))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Where a waiting request stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub request_id: String,
    /// 1-based position; 1 is the next candidate for admission.
    pub position: usize,
    #[serde(rename = "estimatedWaitMs", with = "crate::serde_ms")]
    pub estimated_wait: Duration,
    pub queue_size: usize,
}

/// How a queue entry left its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Admitted by the drain scheduler.
    Admitted,
    /// Waited longer than its `max_wait`.
    Expired,
    /// Withdrawn by the caller.
    Cancelled,
    /// Removed because the engine could not evaluate it.
    Failed,
}

/// Terminal state of a queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    pub status: OutcomeStatus,
    pub entry: QueueEntry,
    pub at: DateTime<Utc>,
}

impl QueueOutcome {
    pub fn new(status: OutcomeStatus, entry: QueueEntry, at: DateTime<Utc>) -> Self {
        Self { status, entry, at }
    }
}
