//! Queue drain scheduler.
//!
//! Each cycle visits every key with waiting entries, reports expired entries,
//! then admits heads one at a time until a head is denied. A denied head
//! blocks everything behind it for that cycle, so no entry is ever admitted
//! ahead of one ranked before it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionEngine, UsageKey};
use crate::clock::Clock;
use crate::metrics::{MetricEvent, MetricsAggregator};
use crate::queue::{OutcomeLog, OutcomeStatus, QueueEntry, QueueOutcome, WaitQueues};

/// Buffered outcomes per subscriber before slow receivers start lagging.
const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// What a single drain cycle did.
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    pub admitted: Vec<QueueOutcome>,
    pub expired: Vec<QueueOutcome>,
    pub failed: Vec<QueueOutcome>,
    pub purged_buckets: usize,
    pub evicted_outcomes: usize,
    pub evicted_identifiers: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.expired.is_empty() && self.failed.is_empty()
    }

    /// Request ids admitted this cycle, in admission order.
    pub fn admitted_ids(&self) -> Vec<&str> {
        self.admitted
            .iter()
            .map(|o| o.entry.request_id.as_str())
            .collect()
    }
}

/// Drains wait queues through the admission engine.
pub struct DrainScheduler {
    engine: Arc<AdmissionEngine>,
    queues: Arc<WaitQueues>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    outcomes: broadcast::Sender<QueueOutcome>,
    /// Finished entries, queryable after they leave their queue.
    history: OutcomeLog,
    /// Held for a whole cycle so cycles never overlap.
    cycle: Mutex<()>,
}

impl DrainScheduler {
    pub fn new(
        engine: Arc<AdmissionEngine>,
        queues: Arc<WaitQueues>,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            engine,
            queues,
            metrics,
            clock,
            outcomes,
            history: OutcomeLog::default(),
            cycle: Mutex::new(()),
        }
    }

    /// Receive every queue outcome published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueOutcome> {
        self.outcomes.subscribe()
    }

    /// Record a terminal outcome and broadcast it. Also used for entries
    /// removed outside a drain cycle (cancel).
    pub fn publish(&self, outcome: QueueOutcome) {
        self.history.record(&outcome);
        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    /// How a request left its queue, while the outcome is retained.
    pub fn outcome(&self, key: &UsageKey, request_id: &str) -> Option<QueueOutcome> {
        self.history.get(key, request_id)
    }

    pub fn history(&self) -> &OutcomeLog {
        &self.history
    }

    /// Run one cycle at the clock's current time.
    pub async fn drain_once(&self) -> DrainReport {
        let now = self.clock.now();
        self.drain_at(now).await
    }

    /// Run one cycle at `now`.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> DrainReport {
        let _cycle = self.cycle.lock().await;
        let mut report = DrainReport::default();

        for key in self.queues.active_keys() {
            self.expire(&key, now, &mut report);
            self.admit_heads(&key, now, &mut report).await;
        }

        match self.engine.purge(now).await {
            Ok(removed) => report.purged_buckets = removed,
            Err(e) => warn!(error = %e, "Failed to purge stale counters"),
        }
        report.evicted_outcomes = self.history.sweep(now);
        report.evicted_identifiers = self.metrics.purge_idle(now);

        report
    }

    fn expire(&self, key: &UsageKey, now: DateTime<Utc>, report: &mut DrainReport) {
        for entry in self.queues.dequeue_if_expired(key, now) {
            warn!(
                key = %key,
                request_id = %entry.request_id,
                operation = %entry.operation,
                max_wait_ms = entry.max_wait.as_millis() as u64,
                "Queued request expired"
            );
            self.metrics.record(key, MetricEvent::Expired, now);
            report
                .expired
                .push(self.finish(OutcomeStatus::Expired, entry, now));
        }
    }

    async fn admit_heads(&self, key: &UsageKey, now: DateTime<Utc>, report: &mut DrainReport) {
        while let Some(head) = self.queues.peek_head(key, now) {
            match self.engine.admit_queued(key, now).await {
                Ok(result) if result.allowed => {
                    match self.queues.remove_head(key, &head.request_id) {
                        Some(entry) => {
                            debug!(
                                key = %key,
                                request_id = %entry.request_id,
                                priority = %entry.priority,
                                "Admitted queued request"
                            );
                            report
                                .admitted
                                .push(self.finish(OutcomeStatus::Admitted, entry, now));
                        }
                        None => {
                            // Cancelled between admission and removal
                            debug!(key = %key, request_id = %head.request_id, "Head vanished after admission");
                            if let Err(e) = self.engine.release(key, 1).await {
                                warn!(key = %key, error = %e, "Failed to roll back admission");
                            }
                        }
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    error!(
                        key = %key,
                        request_id = %head.request_id,
                        error = %e,
                        "Failed to evaluate queued request"
                    );
                    if let Some(entry) = self.queues.remove_head(key, &head.request_id) {
                        self.metrics.record(key, MetricEvent::Failed, now);
                        report
                            .failed
                            .push(self.finish(OutcomeStatus::Failed, entry, now));
                    }
                    break;
                }
            }
        }
    }

    fn finish(&self, status: OutcomeStatus, entry: QueueEntry, now: DateTime<Utc>) -> QueueOutcome {
        let outcome = QueueOutcome::new(status, entry, now);
        self.publish(outcome.clone());
        outcome
    }

    /// Start the recurring drain task.
    ///
    /// The task stops at the next tick boundary once `shutdown` is cancelled;
    /// await the handle to know it has finished. Ticks missed while a cycle
    /// runs are skipped.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Drain scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Drain scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.drain_once().await;
                        if !report.is_empty() {
                            debug!(
                                admitted = report.admitted.len(),
                                expired = report.expired.len(),
                                failed = report.failed.len(),
                                waiting = self.queues.total_len(),
                                "Drain cycle complete"
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        builtin_default, Ceilings, IdentifierType, LimitConfig, LimitRegistry, Thresholds,
    };
    use crate::clock::ManualClock;
    use crate::error::{AdmissionError, Result};
    use crate::queue::Priority;
    use crate::store::{
        CounterStore, MemoryConfigStore, MemoryCounterStore, Reservation, UsageSnapshot,
    };
    use async_trait::async_trait;

    struct Harness {
        scheduler: Arc<DrainScheduler>,
        queues: Arc<WaitQueues>,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<ManualClock>,
        key: UsageKey,
    }

    async fn harness_with(counters: Arc<dyn CounterStore>, limits: Thresholds) -> Harness {
        let registry = Arc::new(LimitRegistry::new(Arc::new(MemoryConfigStore::new())));
        registry
            .set_config(LimitConfig {
                identifier: "u1".to_string(),
                identifier_type: IdentifierType::User,
                limits,
                burst_allowance: 0,
                ..builtin_default(IdentifierType::User)
            })
            .await
            .unwrap();

        let metrics = Arc::new(MetricsAggregator::new());
        let engine = Arc::new(AdmissionEngine::new(registry, counters, metrics.clone()));
        let queues = Arc::new(WaitQueues::new(Duration::from_millis(100)));
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let scheduler = Arc::new(DrainScheduler::new(
            engine,
            queues.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        Harness {
            scheduler,
            queues,
            metrics,
            clock,
            key: UsageKey::new("u1", IdentifierType::User),
        }
    }

    async fn harness(limits: Thresholds) -> Harness {
        harness_with(Arc::new(MemoryCounterStore::new()), limits).await
    }

    fn one_per_second() -> Thresholds {
        Thresholds {
            per_second: Some(1),
            ..Default::default()
        }
    }

    impl Harness {
        fn enqueue(&self, id: &str, priority: Priority, max_wait: Duration) {
            let entry = QueueEntry::new(id, self.key.clone(), "op", priority, self.clock.now(), max_wait);
            self.queues.enqueue(entry, 10).unwrap();
        }
    }

    #[tokio::test]
    async fn test_drains_in_priority_order_one_per_tick() {
        let h = harness(one_per_second()).await;
        let wait = Duration::from_secs(60);
        h.enqueue("low", Priority::Low, wait);
        h.enqueue("critical", Priority::Critical, wait);
        h.enqueue("normal", Priority::Normal, wait);

        let mut order = Vec::new();
        for _ in 0..3 {
            let report = h.scheduler.drain_once().await;
            assert_eq!(report.admitted.len(), 1);
            order.push(report.admitted[0].entry.request_id.clone());
            h.clock.advance(Duration::from_secs(1));
        }

        assert_eq!(order, vec!["critical", "normal", "low"]);
        assert_eq!(h.queues.len(&h.key), 0);
        assert_eq!(h.metrics.for_key(&h.key).unwrap().dequeued, 3);
    }

    #[tokio::test]
    async fn test_admits_until_head_denied() {
        let h = harness(Thresholds {
            per_second: Some(2),
            ..Default::default()
        })
        .await;
        for id in ["a", "b", "c"] {
            h.enqueue(id, Priority::Normal, Duration::from_secs(60));
        }

        let report = h.scheduler.drain_once().await;
        assert_eq!(report.admitted_ids(), vec!["a", "b"]);
        assert_eq!(h.queues.peek_head(&h.key, h.clock.now()).unwrap().request_id, "c");
    }

    #[tokio::test]
    async fn test_expired_entries_reported_not_dropped() {
        let h = harness(Thresholds {
            per_second: Some(1),
            ..Default::default()
        })
        .await;
        let mut outcomes = h.scheduler.subscribe();

        // Fill this second so nothing can be admitted
        h.scheduler
            .engine
            .evaluate(&h.key, 1, h.clock.now())
            .await
            .unwrap();
        h.enqueue("impatient", Priority::High, Duration::from_millis(100));

        h.clock.advance(Duration::from_millis(150));
        assert!(h.queues.peek_head(&h.key, h.clock.now()).is_none());

        let report = h.scheduler.drain_once().await;
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.expired[0].status, OutcomeStatus::Expired);
        assert_eq!(report.expired[0].entry.request_id, "impatient");
        assert!(report.admitted.is_empty());

        let published = outcomes.recv().await.unwrap();
        assert_eq!(published.status, OutcomeStatus::Expired);
        assert_eq!(h.metrics.for_key(&h.key).unwrap().expired, 1);
    }

    #[tokio::test]
    async fn test_denied_head_blocks_lower_priority() {
        // Concurrency cap of 1: one admission, then the next head must wait
        let h = harness(Thresholds {
            concurrent: Some(1),
            ..Default::default()
        })
        .await;
        h.enqueue("first", Priority::High, Duration::from_secs(60));
        h.enqueue("second", Priority::Low, Duration::from_secs(60));

        assert_eq!(h.scheduler.drain_once().await.admitted_ids(), vec!["first"]);
        assert!(h.scheduler.drain_once().await.admitted.is_empty());

        h.scheduler.engine.release(&h.key, 1).await.unwrap();
        assert_eq!(h.scheduler.drain_once().await.admitted_ids(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_outcomes_retained_then_evicted_by_tick() {
        let h = harness(Thresholds {
            concurrent: Some(1),
            ..Default::default()
        })
        .await;
        h.enqueue("kept", Priority::Normal, Duration::from_secs(60));
        h.enqueue("late", Priority::Normal, Duration::from_millis(100));

        h.scheduler.drain_once().await;
        h.clock.advance(Duration::from_millis(200));
        h.scheduler.drain_once().await;

        let kept = h.scheduler.outcome(&h.key, "kept").unwrap();
        let late = h.scheduler.outcome(&h.key, "late").unwrap();
        assert_eq!(kept.status, OutcomeStatus::Admitted);
        assert_eq!(late.status, OutcomeStatus::Expired);

        h.clock.advance(crate::queue::DEFAULT_OUTCOME_TTL);
        let report = h.scheduler.drain_once().await;
        assert_eq!(report.evicted_outcomes, 2);
        assert!(h.scheduler.outcome(&h.key, "kept").is_none());
        assert!(h.scheduler.history().is_empty());
    }

    struct FailingCounterStore;

    #[async_trait]
    impl CounterStore for FailingCounterStore {
        async fn record_usage(&self, _: &UsageKey, _: u64, _: DateTime<Utc>) -> Result<()> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn peek_usage(&self, _: &UsageKey, _: DateTime<Utc>) -> Result<UsageSnapshot> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn record_if_within(
            &self,
            _: &UsageKey,
            _: u64,
            _: &Ceilings,
            _: DateTime<Utc>,
        ) -> Result<Reservation> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn release(&self, _: &UsageKey, _: u64) -> Result<u64> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn purge_stale(&self, _: &UsageKey, _: DateTime<Utc>) -> Result<usize> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn purge_all(&self, _: DateTime<Utc>) -> Result<usize> {
            Err(AdmissionError::Internal("store offline".into()))
        }
        async fn reset(&self, _: &UsageKey) -> Result<()> {
            Err(AdmissionError::Internal("store offline".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_reports_failed_not_expired() {
        let h = harness_with(Arc::new(FailingCounterStore), one_per_second()).await;
        h.enqueue("doomed", Priority::Normal, Duration::from_secs(60));
        h.enqueue("next", Priority::Normal, Duration::from_secs(60));

        let report = h.scheduler.drain_once().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].status, OutcomeStatus::Failed);
        assert!(report.expired.is_empty());
        // The drain for this key stopped at the failure
        assert_eq!(h.queues.len(&h.key), 1);
    }

    #[tokio::test]
    async fn test_spawned_task_drains_and_stops_on_cancel() {
        let h = harness(one_per_second()).await;
        let mut outcomes = h.scheduler.subscribe();
        h.enqueue("bg", Priority::Normal, Duration::from_secs(60));

        let shutdown = CancellationToken::new();
        let handle = h
            .scheduler
            .clone()
            .spawn(Duration::from_millis(10), shutdown.clone());

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .expect("drain task should publish an outcome")
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Admitted);
        assert_eq!(outcome.entry.request_id, "bg");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("drain task should stop")
            .unwrap();
    }
}
