//! Admission decision engine.
//!
//! Fixed-window counting: each granularity counts weight per aligned bucket
//! and resets at the boundary. Memory and update cost are O(1) per active
//! window; the price is that a caller can spend up to twice its rate across
//! a boundary (end of one bucket plus start of the next).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::key::UsageKey;
use super::limits::Thresholds;
use super::registry::LimitRegistry;
use super::window::Granularity;
use crate::error::{AdmissionError, Result};
use crate::metrics::{MetricEvent, MetricsAggregator};
use crate::store::{CounterStore, Reservation, UsageSnapshot, Violations};

/// Shortest retry hint handed back on denial.
const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Usage after the commit when allowed, at decision time when denied.
    pub current_usage: UsageSnapshot,
    pub limits: Thresholds,
    pub burst_allowance: u64,
    /// When each configured window next rolls over.
    pub reset_times: BTreeMap<Granularity, DateTime<Utc>>,
    /// Present iff the request was denied.
    #[serde(
        rename = "retryAfterMs",
        with = "crate::serde_ms::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_after: Option<Duration>,
}

/// Evaluates requests against configured limits and commits usage.
pub struct AdmissionEngine {
    registry: Arc<LimitRegistry>,
    counters: Arc<dyn CounterStore>,
    metrics: Arc<MetricsAggregator>,
}

impl AdmissionEngine {
    pub fn new(
        registry: Arc<LimitRegistry>,
        counters: Arc<dyn CounterStore>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            registry,
            counters,
            metrics,
        }
    }

    /// Evaluate a live request of `weight` units and commit it if allowed.
    ///
    /// A denial is a normal result carrying `retry_after`, not an error.
    pub async fn evaluate(
        &self,
        key: &UsageKey,
        weight: u64,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult> {
        if weight == 0 {
            return Err(AdmissionError::validation("requestWeight must be at least 1"));
        }

        let result = self.decide(key, weight, now).await?;
        let event = if result.allowed {
            MetricEvent::Allowed
        } else {
            MetricEvent::Blocked
        };
        self.metrics.record(key, event, now);
        Ok(result)
    }

    /// Evaluate the head of a wait queue: weight 1, counted as a dequeue
    /// when allowed and not counted at all when denied.
    pub async fn admit_queued(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<AdmissionResult> {
        let result = self.decide(key, 1, now).await?;
        if result.allowed {
            self.metrics.record(key, MetricEvent::Dequeued, now);
        }
        Ok(result)
    }

    async fn decide(&self, key: &UsageKey, weight: u64, now: DateTime<Utc>) -> Result<AdmissionResult> {
        let config = self.registry.resolve(key).await?;
        let ceilings = config.ceilings();

        trace!(
            key = %key,
            weight = weight,
            limits = ?config.limits,
            "Evaluating admission"
        );

        let reservation = self
            .counters
            .record_if_within(key, weight, &ceilings, now)
            .await?;

        let reset_times = config
            .limits
            .configured()
            .map(|g| (g, g.bucket_end(now)))
            .collect();

        let (allowed, current_usage, retry_after) = match reservation {
            Reservation::Committed(usage) => (true, usage, None),
            Reservation::Rejected { usage, violations } => {
                let retry_after = retry_after(&violations, now);
                debug!(
                    key = %key,
                    weight = weight,
                    windows = ?violations.windows,
                    concurrent = violations.concurrent,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Admission denied"
                );
                (false, usage, Some(retry_after))
            }
        };

        Ok(AdmissionResult {
            allowed,
            current_usage,
            limits: config.limits,
            burst_allowance: config.burst_allowance,
            reset_times,
            retry_after,
        })
    }

    /// Return in-flight weight once the admitted work completes.
    pub async fn release(&self, key: &UsageKey, weight: u64) -> Result<u64> {
        self.counters.release(key, weight).await
    }

    /// Current usage without evaluating anything.
    pub async fn usage(&self, key: &UsageKey, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        self.counters.peek_usage(key, now).await
    }

    /// Drop stale buckets across every key.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        self.counters.purge_all(now).await
    }

    pub fn registry(&self) -> &Arc<LimitRegistry> {
        &self.registry
    }
}

/// Time until the nearest boundary among the violated windows, at least
/// one second. A concurrency-only denial has no boundary to wait for.
fn retry_after(violations: &Violations, now: DateTime<Utc>) -> Duration {
    violations
        .windows
        .iter()
        .map(|g| g.until_reset(now))
        .min()
        .unwrap_or(MIN_RETRY_AFTER)
        .max(MIN_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{builtin_default, IdentifierType, LimitConfig};
    use crate::store::{MemoryConfigStore, MemoryCounterStore};
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn engine() -> (AdmissionEngine, Arc<MetricsAggregator>) {
        let registry = Arc::new(LimitRegistry::new(Arc::new(MemoryConfigStore::new())));
        let metrics = Arc::new(MetricsAggregator::new());
        let engine = AdmissionEngine::new(
            registry,
            Arc::new(MemoryCounterStore::new()),
            metrics.clone(),
        );
        (engine, metrics)
    }

    async fn configure(engine: &AdmissionEngine, id: &str, limits: Thresholds) -> UsageKey {
        let config = LimitConfig {
            identifier: id.to_string(),
            identifier_type: IdentifierType::User,
            limits,
            burst_allowance: 0,
            ..builtin_default(IdentifierType::User)
        };
        engine.registry().set_config(config).await.unwrap();
        UsageKey::new(id, IdentifierType::User)
    }

    #[tokio::test]
    async fn test_per_minute_boundary() {
        let (engine, _) = engine();
        let n = 5;
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                per_minute: Some(n),
                ..Default::default()
            },
        )
        .await;

        for i in 1..=n {
            let result = engine.evaluate(&key, 1, at(60_000 + i as i64 * 100)).await.unwrap();
            assert!(result.allowed, "request {} should be allowed", i);
            engine.release(&key, 1).await.unwrap();
        }

        let result = engine.evaluate(&key, 1, at(119_000)).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(Duration::from_secs(1)));

        // Next minute bucket starts fresh
        let result = engine.evaluate(&key, 1, at(120_000)).await.unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_three_checks_in_one_second() {
        let (engine, metrics) = engine();
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                per_second: Some(2),
                ..Default::default()
            },
        )
        .await;

        let mut decisions = Vec::new();
        for offset in [0, 100, 200] {
            decisions.push(engine.evaluate(&key, 1, at(5_000 + offset)).await.unwrap());
        }

        let allowed: Vec<bool> = decisions.iter().map(|r| r.allowed).collect();
        assert_eq!(allowed, vec![true, true, false]);
        assert!(decisions[0].retry_after.is_none());
        assert!(decisions[2].retry_after.unwrap() <= Duration::from_millis(1000));

        let counts = metrics.for_key(&key).unwrap();
        assert_eq!(counts.allowed, 2);
        assert_eq!(counts.blocked, 1);
    }

    #[tokio::test]
    async fn test_retry_after_uses_nearest_violated_boundary() {
        let (engine, _) = engine();
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                per_minute: Some(1),
                per_hour: Some(1),
                ..Default::default()
            },
        )
        .await;

        engine.evaluate(&key, 1, at(0)).await.unwrap();
        let result = engine.evaluate(&key, 1, at(45_000)).await.unwrap();
        assert!(!result.allowed);
        // Minute rolls over in 15s, hour much later
        assert_eq!(result.retry_after, Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_concurrency_denial_and_release() {
        let (engine, _) = engine();
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                concurrent: Some(2),
                ..Default::default()
            },
        )
        .await;

        assert!(engine.evaluate(&key, 2, at(0)).await.unwrap().allowed);
        let denied = engine.evaluate(&key, 1, at(0)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(MIN_RETRY_AFTER));
        assert_eq!(denied.current_usage.concurrent, 2);

        assert_eq!(engine.release(&key, 1).await.unwrap(), 1);
        assert!(engine.evaluate(&key, 1, at(0)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_burst_allowance_extends_rate_threshold() {
        let (engine, _) = engine();
        let config = LimitConfig {
            identifier: "bursty".to_string(),
            identifier_type: IdentifierType::User,
            limits: Thresholds {
                per_second: Some(2),
                ..Default::default()
            },
            burst_allowance: 1,
            ..builtin_default(IdentifierType::User)
        };
        engine.registry().set_config(config).await.unwrap();
        let key = UsageKey::new("bursty", IdentifierType::User);

        let allowed: Vec<bool> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(engine.evaluate(&key, 1, at(0)).await.unwrap().allowed);
            }
            out
        };
        assert_eq!(allowed, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_unconfigured_identifier_uses_type_default() {
        let (engine, _) = engine();
        let key = UsageKey::new("203.0.113.9", IdentifierType::Ip);
        let default = builtin_default(IdentifierType::Ip);
        let ceiling = default.limits.per_second.unwrap() + default.burst_allowance;

        for _ in 0..ceiling {
            assert!(engine.evaluate(&key, 1, at(0)).await.unwrap().allowed);
            engine.release(&key, 1).await.unwrap();
        }
        let result = engine.evaluate(&key, 1, at(0)).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.limits, default.limits);
        assert_eq!(result.reset_times.len(), 4);
        assert!(engine.registry().get_config(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_weight_rejected() {
        let (engine, _) = engine();
        let key = UsageKey::new("u1", IdentifierType::User);
        let result = engine.evaluate(&key, 0, at(0)).await;
        assert!(matches!(result, Err(AdmissionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_admit_queued_counts_only_admissions() {
        let (engine, metrics) = engine();
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                per_second: Some(1),
                ..Default::default()
            },
        )
        .await;

        assert!(engine.admit_queued(&key, at(0)).await.unwrap().allowed);
        assert!(!engine.admit_queued(&key, at(0)).await.unwrap().allowed);

        let counts = metrics.for_key(&key).unwrap();
        assert_eq!(counts.dequeued, 1);
        assert_eq!(counts.blocked, 0);
        assert_eq!(counts.allowed, 0);
    }

    #[tokio::test]
    async fn test_result_wire_format() {
        let (engine, _) = engine();
        let key = configure(
            &engine,
            "u1",
            Thresholds {
                per_second: Some(1),
                ..Default::default()
            },
        )
        .await;

        engine.evaluate(&key, 1, at(0)).await.unwrap();
        let denied = engine.evaluate(&key, 1, at(0)).await.unwrap();
        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["retryAfterMs"], 1000);
        assert_eq!(json["limits"]["perSecond"], 1);
        assert!(json["resetTimes"]["second"].is_string());
        assert_eq!(json["currentUsage"]["perSecond"], 1);
    }
}
