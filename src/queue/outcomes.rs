//! Recently finished queue entries, kept so callers can learn how their
//! request left the queue after it is gone.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use super::entry::QueueOutcome;
use crate::admission::UsageKey;

/// How long a finished entry stays queryable.
pub const DEFAULT_OUTCOME_TTL: Duration = Duration::from_secs(300);

/// Most finished entries remembered at once; the oldest go first.
pub const DEFAULT_OUTCOME_CAPACITY: usize = 10_000;

type OutcomeRef = (UsageKey, String);

#[derive(Debug, Default)]
struct Inner {
    outcomes: HashMap<OutcomeRef, QueueOutcome>,
    /// Insertion order. May hold refs already replaced or forgotten;
    /// those are skipped on eviction by comparing the stored time.
    order: VecDeque<(DateTime<Utc>, OutcomeRef)>,
}

impl Inner {
    fn evict_front(&mut self) -> bool {
        let Some((at, outcome_ref)) = self.order.pop_front() else {
            return false;
        };
        if self.outcomes.get(&outcome_ref).map(|o| o.at) == Some(at) {
            self.outcomes.remove(&outcome_ref);
        }
        true
    }
}

/// Bounded, time-limited record of terminal queue outcomes keyed by
/// (key, requestId).
#[derive(Debug)]
pub struct OutcomeLog {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self::new(DEFAULT_OUTCOME_TTL, DEFAULT_OUTCOME_CAPACITY)
    }
}

impl OutcomeLog {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Remember an outcome, replacing any earlier one for the same request.
    pub fn record(&self, outcome: &QueueOutcome) {
        let outcome_ref = (outcome.entry.key.clone(), outcome.entry.request_id.clone());
        let mut inner = self.inner.lock();
        inner.order.push_back((outcome.at, outcome_ref.clone()));
        inner.outcomes.insert(outcome_ref, outcome.clone());

        while inner.outcomes.len() > self.capacity {
            if !inner.evict_front() {
                break;
            }
        }
    }

    /// The outcome of a request that has left its queue, if still retained.
    pub fn get(&self, key: &UsageKey, request_id: &str) -> Option<QueueOutcome> {
        self.inner
            .lock()
            .outcomes
            .get(&(key.clone(), request_id.to_string()))
            .cloned()
    }

    /// Drop a single request's outcome, e.g. when its id is queued again.
    pub fn forget(&self, key: &UsageKey, request_id: &str) {
        self.inner
            .lock()
            .outcomes
            .remove(&(key.clone(), request_id.to_string()));
    }

    /// Drop every outcome of a key. Returns how many were removed.
    pub fn clear(&self, key: &UsageKey) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.outcomes.len();
        inner.outcomes.retain(|(k, _), _| k != key);
        before - inner.outcomes.len()
    }

    /// Evict outcomes older than the TTL. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.lock();
        let before = inner.outcomes.len();

        while let Some((at, _)) = inner.order.front() {
            if now.signed_duration_since(*at) < ttl {
                break;
            }
            inner.evict_front();
        }

        let removed = before - inner.outcomes.len();
        if removed > 0 {
            debug!(removed = removed, retained = inner.outcomes.len(), "Evicted queue outcomes");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
