//! Broker contract: publish with priority and delay, blocking consume with a
//! single outstanding credit, ack/nack per delivery, reconnect on transport
//! failure.
//!
//! Wire-level detail (queue topology, how delayed delivery is implemented) is
//! the driver's concern. The priority-inversion and delay-computation rules
//! here are fixed contracts.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ToilError};
use crate::job::JobId;

/// One instance of the broker handing a message to a consumer. Distinct from
/// the job it references: a job may be delivered more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Driver-issued tag identifying this specific delivery.
    pub tag: u64,
    /// The job this delivery references.
    pub job_id: JobId,
    /// Whether the broker has handed this message out before.
    pub redelivered: bool,
}

/// Message-queue contract consumed by the engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a job reference with a broker priority (0-255, higher is more
    /// urgent) and a delivery delay. Drivers route through a delay-capable
    /// path when `delay` is non-zero and a direct path otherwise.
    async fn publish(&self, job_id: JobId, priority: u8, delay: Duration) -> Result<()>;

    /// Wait up to `wait` for the next delivery. Returns `None` on timeout,
    /// giving the caller a heartbeat opportunity.
    ///
    /// Single-outstanding-credit semantics: a driver must not hand out a new
    /// message while a previous delivery is unacknowledged; an unacked
    /// delivery is re-presented with `redelivered` set.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Re-establish the underlying transport after a transport failure.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// A type-erased broker shared across tasks.
pub type SharedBroker = Arc<dyn Broker>;

/// Map a domain priority onto a broker priority.
///
/// Inverted: numerically smaller job priorities are more urgent, so they map
/// to numerically larger broker priorities. A job priority above the
/// configured maximum clamps to zero. Fixed contract: priority 100 of 255
/// maps to broker priority 155.
pub fn broker_priority(job_priority: u8, max_priority: u8) -> u8 {
    max_priority.saturating_sub(job_priority)
}

/// Delay before a publication becomes deliverable: `run_at - now`, zero if
/// due now or in the past.
pub fn publish_delay(run_at_ms: i64, now_ms: i64) -> Duration {
    if run_at_ms <= now_ms {
        Duration::ZERO
    } else {
        Duration::from_millis((run_at_ms - now_ms) as u64)
    }
}

/// Publish with a bounded reconnect-retry loop.
///
/// Only transport-level failures are retried: reconnect the connection, pause,
/// retry the single failed publish, at most `attempts` times in total. Any
/// other error propagates immediately.
pub async fn publish_with_reconnect(
    broker: &dyn Broker,
    job_id: JobId,
    priority: u8,
    delay: Duration,
    attempts: u32,
    pause: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last: Option<ToilError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            if let Err(e) = broker.reconnect().await {
                tracing::warn!(error = %e, job_id = %job_id, "broker reconnect failed");
            }
            tokio::time::sleep(pause).await;
        }

        match broker.publish(job_id, priority, delay).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    job_id = %job_id,
                    attempt = attempt + 1,
                    error = %e,
                    "transport failure during publish, will reconnect and retry"
                );
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last.unwrap_or_else(|| ToilError::Transport("publish retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_priority_inversion() {
        // Fixed contract from observed default behavior.
        assert_eq!(broker_priority(100, 255), 155);
        assert_eq!(broker_priority(0, 255), 255);
        assert_eq!(broker_priority(255, 255), 0);
    }

    #[test]
    fn test_priority_clamps_at_zero() {
        assert_eq!(broker_priority(200, 100), 0);
    }

    #[test]
    fn test_priority_mapping_is_monotonically_decreasing() {
        let mut previous = u16::MAX;
        for job_priority in 0u16..=255 {
            let mapped = broker_priority(job_priority as u8, 255) as u16;
            assert!(mapped <= previous);
            previous = mapped;
        }
    }

    #[test]
    fn test_publish_delay_future() {
        let now = 1_000_000;
        assert_eq!(publish_delay(now + 2000, now), Duration::from_millis(2000));
    }

    #[test]
    fn test_publish_delay_due_or_past() {
        let now = 1_000_000;
        assert_eq!(publish_delay(now, now), Duration::ZERO);
        assert_eq!(publish_delay(now - 500, now), Duration::ZERO);
    }

    /// Broker that fails the first N publishes with a transport error.
    struct FlakyBroker {
        failures_left: AtomicU32,
        transport: bool,
        publishes: AtomicU32,
        reconnects: AtomicU32,
    }

    impl FlakyBroker {
        fn new(failures: u32, transport: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                transport,
                publishes: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, _job_id: JobId, _priority: u8, _delay: Duration) -> Result<()> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(if self.transport {
                    ToilError::Transport("connection reset".to_string())
                } else {
                    ToilError::Broker("bad routing".to_string())
                });
            }
            Ok(())
        }

        async fn receive(&self, _wait: Duration) -> Result<Option<Delivery>> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }

        async fn nack(&self, _delivery: &Delivery, _requeue: bool) -> Result<()> {
            Ok(())
        }

        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_with_reconnect_recovers_from_transport_failure() {
        let broker = FlakyBroker::new(2, true);
        publish_with_reconnect(
            &broker,
            JobId(1),
            100,
            Duration::ZERO,
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(broker.publishes.load(Ordering::SeqCst), 3);
        assert_eq!(broker.reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_with_reconnect_exhausts_attempts() {
        let broker = FlakyBroker::new(5, true);
        let err = publish_with_reconnect(
            &broker,
            JobId(1),
            100,
            Duration::ZERO,
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transport_errors_are_not_retried() {
        let broker = FlakyBroker::new(1, false);
        let err = publish_with_reconnect(
            &broker,
            JobId(1),
            100,
            Duration::ZERO,
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ToilError::Broker(_)));
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.reconnects.load(Ordering::SeqCst), 0);
    }
}
