//! The admission service: validated entry points over the engine, the wait
//! queues and the metrics.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::admission::{AdmissionEngine, AdmissionResult, LimitConfig, LimitRegistry, UsageKey};
use crate::api::{CheckRequest, EnqueueRequest, KeyRequest, QueueRef, ReleaseRequest};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::metrics::{MetricEvent, MetricsAggregator, MetricsFilter, MetricsSnapshot};
use crate::queue::{OutcomeStatus, QueueEntry, QueueOutcome, QueueStatus, WaitQueues};
use crate::scheduler::DrainScheduler;
use crate::store::{ConfigStore, CounterStore, MemoryConfigStore, MemoryCounterStore};

/// Every component of the engine, wired together with explicit handles.
pub struct AdmissionService {
    registry: Arc<LimitRegistry>,
    counters: Arc<dyn CounterStore>,
    engine: Arc<AdmissionEngine>,
    queues: Arc<WaitQueues>,
    scheduler: Arc<DrainScheduler>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
}

impl AdmissionService {
    /// Wire a service over the given stores.
    pub fn new(
        counters: Arc<dyn CounterStore>,
        configs: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        average_service: Duration,
    ) -> Self {
        let registry = Arc::new(LimitRegistry::new(configs));
        let metrics = Arc::new(MetricsAggregator::new());
        let engine = Arc::new(AdmissionEngine::new(
            registry.clone(),
            counters.clone(),
            metrics.clone(),
        ));
        let queues = Arc::new(WaitQueues::new(average_service));
        let scheduler = Arc::new(DrainScheduler::new(
            engine.clone(),
            queues.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        Self {
            registry,
            counters,
            engine,
            queues,
            scheduler,
            metrics,
            clock,
        }
    }

    /// A single-process service with in-memory stores.
    pub fn in_memory(clock: Arc<dyn Clock>, average_service: Duration) -> Self {
        Self::new(
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryConfigStore::new()),
            clock,
            average_service,
        )
    }

    pub fn registry(&self) -> &Arc<LimitRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<DrainScheduler> {
        &self.scheduler
    }

    pub fn queues(&self) -> &Arc<WaitQueues> {
        &self.queues
    }

    /// Validate and store a per-identifier config.
    #[instrument(
        skip(self, config),
        fields(identifier = %config.identifier, identifier_type = %config.identifier_type)
    )]
    pub async fn put_config(&self, mut config: LimitConfig) -> Result<LimitConfig> {
        config.identifier = config.identifier.trim().to_string();
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected limit config");
            return Err(e);
        }
        self.registry.set_config(config.clone()).await?;
        info!(limits = ?config.limits, "Limit config stored");
        Ok(config)
    }

    /// The stored config for a key, or `None`.
    pub async fn get_config(&self, req: &KeyRequest) -> Result<Option<LimitConfig>> {
        let key = req.key()?;
        self.registry.get_config(&key).await
    }

    /// Decide whether a request may proceed now. Never waits.
    #[instrument(
        skip(self, req),
        fields(
            identifier = %req.identifier,
            identifier_type = %req.identifier_type,
            weight = req.request_weight
        )
    )]
    pub async fn check(&self, req: &CheckRequest) -> Result<AdmissionResult> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        if req.request_weight == 0 {
            warn!("Received check with zero weight");
            return Err(AdmissionError::validation("requestWeight must be at least 1"));
        }

        let result = self
            .engine
            .evaluate(&key, req.request_weight, self.clock.now())
            .await?;

        debug!(
            key = %key,
            operation = %req.operation,
            allowed = result.allowed,
            "Admission decision made"
        );
        Ok(result)
    }

    /// Hold a request in its key's wait queue.
    #[instrument(
        skip(self, req),
        fields(
            identifier = %req.identifier,
            identifier_type = %req.identifier_type,
            request_id = %req.request_id
        )
    )]
    pub async fn enqueue(&self, req: &EnqueueRequest) -> Result<QueueStatus> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        let request_id = req.request_id.trim();
        if request_id.is_empty() {
            return Err(AdmissionError::validation("requestId is required"));
        }

        let config = self.registry.resolve(&key).await?;
        let policy = config.queue_policy;
        if !policy.enabled {
            return Err(AdmissionError::validation(format!(
                "queueing is disabled for {}",
                key
            )));
        }

        let max_wait = match req.max_wait_ms {
            Some(0) => return Err(AdmissionError::validation("maxWaitMs must be positive")),
            Some(ms) => Duration::from_millis(ms).min(policy.max_wait),
            None => policy.max_wait,
        };
        let priority = req.priority.unwrap_or(config.priority);
        let now = self.clock.now();
        let entry = QueueEntry::new(
            request_id,
            key.clone(),
            req.operation.clone(),
            priority,
            now,
            max_wait,
        );

        match self.queues.enqueue(entry, policy.max_queue_size) {
            Ok(status) => {
                // A reused requestId starts over
                self.scheduler.history().forget(&key, request_id);
                self.metrics.record(&key, MetricEvent::Queued, now);
                debug!(position = status.position, queue_size = status.queue_size, "Request queued");
                Ok(status)
            }
            Err(e) => {
                if matches!(e, AdmissionError::QueueFull { .. }) {
                    self.metrics.record(&key, MetricEvent::QueueRejected, now);
                }
                warn!(error = %e, "Enqueue refused");
                Err(e)
            }
        }
    }

    /// Where a queued request stands, or `None` once it left the queue.
    pub async fn queue_status(&self, req: &QueueRef) -> Result<Option<QueueStatus>> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        Ok(self
            .queues
            .status(&key, req.request_id.trim(), self.clock.now()))
    }

    /// How a request left its queue (admitted, expired, cancelled or
    /// failed), or `None` while it is still waiting or once the outcome
    /// has been evicted.
    ///
    /// An admitted entry holds one unit of concurrency until released.
    pub async fn queue_outcome(&self, req: &QueueRef) -> Result<Option<QueueOutcome>> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        Ok(self.scheduler.outcome(&key, req.request_id.trim()))
    }

    /// Withdraw a queued request. Returns whether it was still waiting.
    #[instrument(skip(self, req), fields(identifier = %req.identifier, request_id = %req.request_id))]
    pub async fn cancel(&self, req: &QueueRef) -> Result<bool> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        match self.queues.cancel(&key, req.request_id.trim()) {
            Some(entry) => {
                let now = self.clock.now();
                self.metrics.record(&key, MetricEvent::Cancelled, now);
                self.scheduler
                    .publish(QueueOutcome::new(OutcomeStatus::Cancelled, entry, now));
                debug!("Queued request cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return in-flight weight when admitted work completes.
    pub async fn release(&self, req: &ReleaseRequest) -> Result<u64> {
        let key = UsageKey::parse(&req.identifier, req.identifier_type)?;
        if req.weight == 0 {
            return Err(AdmissionError::validation("weight must be at least 1"));
        }
        self.engine.release(&key, req.weight).await
    }

    /// Aggregate and per-identifier statistics.
    pub fn metrics(&self, filter: &MetricsFilter) -> MetricsSnapshot {
        self.metrics.snapshot(filter)
    }

    /// Clear a key's counters, wait queue, retained outcomes and
    /// per-identifier stats. Safe to repeat.
    ///
    /// Returns the number of queued entries discarded.
    #[instrument(skip(self, req), fields(identifier = %req.identifier, identifier_type = %req.identifier_type))]
    pub async fn reset_state(&self, req: &KeyRequest) -> Result<usize> {
        let key = req.key()?;
        self.counters.reset(&key).await?;
        let discarded = self.queues.clear(&key);
        self.scheduler.history().clear(&key);
        self.metrics.forget(&key);
        info!(discarded = discarded, "State reset");
        Ok(discarded)
    }
}
