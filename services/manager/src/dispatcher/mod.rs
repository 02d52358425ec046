//! Event dispatcher.
//!
//! Delivers a tenant's pending events to a sink and records each outcome on
//! the event itself:
//!
//! - accepted events become `delivered`
//! - rejected events become `failed` with an incremented `retry_count` and a
//!   `next_attempt_at` computed from the backoff policy
//! - once the attempt ceiling is reached, `next_attempt_at` is cleared and
//!   the event is never picked up again
//!
//! Events are handed over in `event_ts` order and a device's events never
//! overtake each other. After a failure, later events for the same device are
//! skipped for the rest of the pass; while the failed event waits out its
//! backoff, the store does not offer them at all. An exhausted event stops
//! holding its device back.

mod sink;
pub mod worker;

pub use sink::{EventSink, RecordingSink, SinkError, WebhookSink, EVENT_ID_HEADER, TENANT_HEADER};
pub use worker::{DispatchWorker, DispatchWorkerConfig, IntegrationSinks, SinkResolver};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shadowsync_events::{DeliveryTransition, Event};
use shadowsync_id::{DeviceId, TenantId};
use shadowsync_reconcile::BackoffPolicy;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::store::{EventStore, StoreError};

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load pending events: {0}")]
    Store(#[from] StoreError),
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum events handled per tenant per pass.
    pub batch_size: u64,

    /// Upper bound on a single send.
    pub send_timeout: Duration,

    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            send_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome counts for one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Events handed to the sink.
    pub attempted: u64,
    pub delivered: u64,
    /// Failed events that will be retried.
    pub failed: u64,
    /// Failed events that reached the attempt ceiling.
    pub exhausted: u64,
    /// Events held back behind an earlier failure for the same device.
    pub deferred: u64,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.exhausted += other.exhausted;
        self.deferred += other.deferred;
    }

    pub fn is_empty(&self) -> bool {
        *self == DeliveryReport::default()
    }
}

/// Delivers pending events from the store to a sink.
#[derive(Clone)]
pub struct EventDispatcher {
    store: Arc<dyn EventStore>,
    config: DispatchConfig,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn EventStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Runs one delivery pass for a tenant.
    pub async fn deliver(
        &self,
        tenant: &TenantId,
        sink: &dyn EventSink,
    ) -> Result<DeliveryReport, DispatchError> {
        self.deliver_at(tenant, sink, Utc::now()).await
    }

    /// Runs one delivery pass as of `now`.
    #[instrument(skip(self, tenant, sink), fields(tenant_id = %tenant))]
    pub async fn deliver_at(
        &self,
        tenant: &TenantId,
        sink: &dyn EventSink,
        now: DateTime<Utc>,
    ) -> Result<DeliveryReport, DispatchError> {
        let backoff = &self.config.backoff;
        let events = self
            .store
            .due_for_delivery(tenant, now, backoff.max_attempts, self.config.batch_size)
            .await?;

        let mut report = DeliveryReport::default();
        let mut blocked: HashSet<DeviceId> = HashSet::new();

        for event in events {
            if blocked.contains(event.device_id()) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match self.send(tenant, sink, &event).await {
                Ok(()) => {
                    self.transition(tenant, &event, DeliveryTransition::Delivered)
                        .await;
                    report.delivered += 1;
                }
                Err(err) => {
                    let attempt = event.delivery.retry_count + 1;
                    let next_attempt_at = if backoff.allows_retry(attempt) {
                        Some(retry_at(now, backoff.delay(attempt)))
                    } else {
                        None
                    };

                    match next_attempt_at {
                        Some(at) => {
                            debug!(event_id = %event.id, attempt, next_attempt_at = %at, error = %err, "Delivery failed, will retry");
                            report.failed += 1;
                        }
                        None => {
                            warn!(event_id = %event.id, attempt, error = %err, "Delivery retries exhausted");
                            report.exhausted += 1;
                        }
                    }

                    let transition = DeliveryTransition::Failed {
                        attempt,
                        error: err.to_string(),
                        next_attempt_at,
                    };
                    self.transition(tenant, &event, transition).await;
                    blocked.insert(event.device_id().clone());
                }
            }
        }

        if !report.is_empty() {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                failed = report.failed,
                exhausted = report.exhausted,
                deferred = report.deferred,
                "Delivery pass complete"
            );
        }
        Ok(report)
    }

    async fn send(&self, tenant: &TenantId, sink: &dyn EventSink, event: &Event) -> Result<(), SinkError> {
        match tokio::time::timeout(self.config.send_timeout, sink.send(tenant, event)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        }
    }

    /// Records a delivery outcome. Failures are logged and left for the
    /// next pass; the event stays eligible and is sent again.
    async fn transition(&self, tenant: &TenantId, event: &Event, transition: DeliveryTransition) {
        match self.store.update_status(tenant, event.id, transition).await {
            Ok(_) => {}
            Err(StoreError::NotFound(id)) => {
                debug!(event_id = %id, "Event expired during delivery");
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to record delivery outcome");
            }
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use shadowsync_events::{DeliveryStatus, EventData, EventsFilter, NewEvent};

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::parse(id).unwrap()
    }

    fn dispatcher(store: &MemoryEventStore, max_attempts: u32) -> EventDispatcher {
        EventDispatcher::new(
            Arc::new(store.clone()),
            DispatchConfig {
                batch_size: 50,
                send_timeout: Duration::from_secs(1),
                backoff: BackoffPolicy {
                    base: Duration::from_secs(10),
                    max: Duration::from_secs(60),
                    max_attempts,
                },
            },
        )
    }

    async fn append(store: &MemoryEventStore, t: &str, data: EventData) -> Event {
        store.append(NewEvent::new(tenant(t), data)).await.unwrap()
    }

    #[tokio::test]
    async fn test_failed_delivery_waits_for_backoff() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 5);
        let sink = RecordingSink::new();
        let t = tenant("t1");
        let event = append(&store, "t1", EventData::provisioned(device("foo"))).await;

        sink.fail_next(SinkError::Rejected {
            status: 503,
            body: String::new(),
        })
        .await;
        let now = Utc::now();
        let report = dispatcher.deliver_at(&t, &sink, now).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);

        let failed = store.get(&t, event.id).await.unwrap();
        assert_eq!(failed.delivery.status, DeliveryStatus::Failed);
        assert_eq!(failed.delivery.retry_count, 1);
        let next = failed.delivery.next_attempt_at.unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(10));
        assert!(failed.delivery.last_error.unwrap().contains("503"));

        let early = dispatcher
            .deliver_at(&t, &sink, next - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(early.attempted, 0);
        assert_eq!(sink.attempts().await, 1);

        let retried = dispatcher.deliver_at(&t, &sink, next).await.unwrap();
        assert_eq!(retried.delivered, 1);
        let delivered = store.get(&t, event.id).await.unwrap();
        assert_eq!(delivered.delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivered.delivery.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retries_stop_at_ceiling() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 2);
        let sink = RecordingSink::failing();
        let t = tenant("t1");
        let event = append(&store, "t1", EventData::provisioned(device("foo"))).await;

        let now = Utc::now();
        let first = dispatcher.deliver_at(&t, &sink, now).await.unwrap();
        assert_eq!(first.failed, 1);

        let later = now + chrono::Duration::hours(1);
        let second = dispatcher.deliver_at(&t, &sink, later).await.unwrap();
        assert_eq!(second.exhausted, 1);

        let exhausted = store.get(&t, event.id).await.unwrap();
        assert!(exhausted.delivery.is_exhausted());
        assert_eq!(exhausted.delivery.retry_count, 2);

        let third = dispatcher
            .deliver_at(&t, &sink, later + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(third.is_empty());
        assert_eq!(sink.attempts().await, 2);
    }

    #[tokio::test]
    async fn test_failure_holds_back_same_device() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 5);
        let sink = RecordingSink::new();
        let t = tenant("t1");
        let a1 = append(&store, "t1", EventData::provisioned(device("a"))).await;
        let b1 = append(&store, "t1", EventData::provisioned(device("b"))).await;
        let a2 = append(&store, "t1", EventData::decommissioned(device("a"))).await;

        sink.fail_next(SinkError::Timeout).await;
        let report = dispatcher.deliver(&t, &sink).await.unwrap();
        assert_eq!(
            report,
            DeliveryReport {
                attempted: 2,
                delivered: 1,
                failed: 1,
                exhausted: 0,
                deferred: 1,
            }
        );

        let delivered: Vec<_> = sink.delivered().await.iter().map(|e| e.id).collect();
        assert_eq!(delivered, vec![b1.id]);
        assert_eq!(
            store.get(&t, a2.id).await.unwrap().delivery.status,
            DeliveryStatus::NotDelivered
        );
        assert_eq!(
            store.get(&t, a1.id).await.unwrap().delivery.status,
            DeliveryStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_device_order_holds_across_passes() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 5);
        let sink = RecordingSink::new();
        let t = tenant("t1");
        let a1 = append(&store, "t1", EventData::provisioned(device("a"))).await;
        let a2 = append(&store, "t1", EventData::decommissioned(device("a"))).await;

        sink.fail_next(SinkError::Timeout).await;
        let now = Utc::now();
        let first = dispatcher.deliver_at(&t, &sink, now).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.deferred, 1);

        // a1 is still backing off, so a2 is not offered either.
        let early = dispatcher
            .deliver_at(&t, &sink, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(early.is_empty());
        assert!(sink.delivered().await.is_empty());

        let retry = dispatcher
            .deliver_at(&t, &sink, now + chrono::Duration::seconds(20))
            .await
            .unwrap();
        assert_eq!(retry.delivered, 2);

        let delivered: Vec<_> = sink.delivered().await.iter().map(|e| e.id).collect();
        assert_eq!(delivered, vec![a1.id, a2.id]);
    }

    #[tokio::test]
    async fn test_delivered_events_are_not_resent() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 5);
        let sink = RecordingSink::new();
        let t = tenant("t1");
        append(&store, "t1", EventData::provisioned(device("foo"))).await;
        append(&store, "t1", EventData::provisioned(device("bar"))).await;

        assert_eq!(dispatcher.deliver(&t, &sink).await.unwrap().delivered, 2);
        assert!(dispatcher.deliver(&t, &sink).await.unwrap().is_empty());
        assert_eq!(sink.delivered().await.len(), 2);

        let delivered = store
            .query(&t, &EventsFilter::new().status(DeliveryStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_is_tenant_scoped() {
        let store = MemoryEventStore::default();
        let dispatcher = dispatcher(&store, 5);
        let sink = RecordingSink::new();
        append(&store, "t1", EventData::provisioned(device("foo"))).await;
        let other = append(&store, "t2", EventData::provisioned(device("foo"))).await;

        dispatcher.deliver(&tenant("t1"), &sink).await.unwrap();
        assert_eq!(sink.delivered().await.len(), 1);
        assert_eq!(
            store.get(&tenant("t2"), other.id).await.unwrap().delivery.status,
            DeliveryStatus::NotDelivered
        );
    }

    #[test]
    fn test_report_merge() {
        let mut total = DeliveryReport::default();
        assert!(total.is_empty());
        total.merge(DeliveryReport {
            attempted: 2,
            delivered: 1,
            failed: 1,
            ..Default::default()
        });
        total.merge(DeliveryReport {
            attempted: 1,
            exhausted: 1,
            ..Default::default()
        });
        assert_eq!(total.attempted, 3);
        assert_eq!(total.exhausted, 1);
    }
}
