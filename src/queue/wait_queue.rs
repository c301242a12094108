//! Bounded, priority-ordered wait queues.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::entry::{QueueEntry, QueueStatus};
use crate::admission::UsageKey;
use crate::error::{AdmissionError, Result};

/// The wait queue of a single key, kept sorted in admission order.
#[derive(Debug, Default)]
pub struct PriorityWaitQueue {
    entries: Vec<QueueEntry>,
    next_sequence: u64,
}

impl PriorityWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry and re-sort. Returns its 1-based position.
    pub fn push(&mut self, mut entry: QueueEntry) -> usize {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        let request_id = entry.request_id.clone();

        self.entries.push(entry);
        self.entries.sort_by(|a, b| a.queue_order(b));

        self.position(&request_id).unwrap_or(self.entries.len())
    }

    /// 1-based position of a request.
    pub fn position(&self, request_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.request_id == request_id)
            .map(|i| i + 1)
    }

    /// 1-based position counting only entries still within their deadline.
    /// `None` if the request is absent or has itself expired.
    pub fn live_position(&self, request_id: &str, now: DateTime<Utc>) -> Option<usize> {
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .position(|e| e.request_id == request_id)
            .map(|i| i + 1)
    }

    /// Entries still within their deadline.
    pub fn live_len(&self, now: DateTime<Utc>) -> usize {
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Remove and return every entry that has waited out its deadline.
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.is_expired(now));
        self.entries = waiting;
        expired
    }

    /// The first entry still within its deadline.
    pub fn head(&self, now: DateTime<Utc>) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| !e.is_expired(now))
    }

    pub fn remove(&mut self, request_id: &str) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.request_id == request_id)?;
        Some(self.entries.remove(index))
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }
}

/// Every key's wait queue.
///
/// Each key's queue is only touched under its map shard lock, so a queue is
/// never observed half-sorted.
#[derive(Debug)]
pub struct WaitQueues {
    queues: DashMap<UsageKey, PriorityWaitQueue>,
    average_service: Duration,
}

impl WaitQueues {
    /// `average_service` is the constant per-position wait estimate.
    pub fn new(average_service: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            average_service,
        }
    }

    fn estimate(&self, position: usize) -> Duration {
        self.average_service
            .saturating_mul(u32::try_from(position).unwrap_or(u32::MAX))
    }

    /// Add an entry to its key's queue.
    ///
    /// Fails with `QueueFull` when the queue already holds `max_size`
    /// entries; nothing already waiting is dropped to make room.
    pub fn enqueue(&self, entry: QueueEntry, max_size: usize) -> Result<QueueStatus> {
        let key = entry.key.clone();
        let mut queue = self.queues.entry(key.clone()).or_default();

        if queue.position(&entry.request_id).is_some() {
            return Err(AdmissionError::validation(format!(
                "requestId '{}' is already queued for {}",
                entry.request_id, key
            )));
        }

        if queue.len() >= max_size {
            let size = queue.len();
            debug!(key = %key, size = size, "Wait queue full");
            return Err(AdmissionError::QueueFull {
                key: key.to_string(),
                size,
                retry_after: self.estimate(size),
            });
        }

        let request_id = entry.request_id.clone();
        let priority = entry.priority;
        let now = entry.enqueue_time;
        let pushed = queue.push(entry);
        let position = queue.live_position(&request_id, now).unwrap_or(pushed);
        let queue_size = queue.live_len(now);

        trace!(
            key = %key,
            request_id = %request_id,
            priority = %priority,
            position = position,
            "Enqueued request"
        );

        Ok(QueueStatus {
            request_id,
            position,
            estimated_wait: self.estimate(position),
            queue_size,
        })
    }

    /// Remove and return every expired entry of a key.
    pub fn dequeue_if_expired(&self, key: &UsageKey, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let expired = match self.queues.get_mut(key) {
            Some(mut queue) => queue.drain_expired(now),
            None => return Vec::new(),
        };
        self.forget_if_empty(key);
        expired
    }

    /// The next candidate for admission, without removing it.
    pub fn peek_head(&self, key: &UsageKey, now: DateTime<Utc>) -> Option<QueueEntry> {
        self.queues.get(key)?.head(now).cloned()
    }

    /// Remove an admitted head.
    pub fn remove_head(&self, key: &UsageKey, request_id: &str) -> Option<QueueEntry> {
        self.remove(key, request_id)
    }

    /// Withdraw a waiting request, freeing its slot immediately.
    pub fn cancel(&self, key: &UsageKey, request_id: &str) -> Option<QueueEntry> {
        self.remove(key, request_id)
    }

    fn remove(&self, key: &UsageKey, request_id: &str) -> Option<QueueEntry> {
        let removed = self.queues.get_mut(key)?.remove(request_id);
        self.forget_if_empty(key);
        removed
    }

    /// Where a request stands, or `None` if it is not waiting.
    ///
    /// Entries past their deadline are invisible here even before the next
    /// drain cycle removes them.
    pub fn status(&self, key: &UsageKey, request_id: &str, now: DateTime<Utc>) -> Option<QueueStatus> {
        let queue = self.queues.get(key)?;
        let position = queue.live_position(request_id, now)?;
        Some(QueueStatus {
            request_id: request_id.to_string(),
            position,
            estimated_wait: self.estimate(position),
            queue_size: queue.live_len(now),
        })
    }

    /// Drop a key's queue. Returns how many entries were discarded.
    pub fn clear(&self, key: &UsageKey) -> usize {
        self.queues
            .remove(key)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0)
    }

    pub fn len(&self, key: &UsageKey) -> usize {
        self.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Entries waiting across every key.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Keys with at least one waiting entry.
    pub fn active_keys(&self) -> Vec<UsageKey> {
        self.queues
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| q.key().clone())
            .collect()
    }

    fn forget_if_empty(&self, key: &UsageKey) {
        self.queues.remove_if(key, |_, queue| queue.is_empty());
    }
}
