//! In-memory event store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shadowsync_events::{DeliveryState, DeliveryTransition, Event, EventsFilter, NewEvent};
use shadowsync_id::{DeviceId, EventId, TenantId};
use tokio::sync::RwLock;
use tracing::debug;

use super::{default_retention, EventStore, StoreError, StoreResult};

/// Process-local [`EventStore`].
///
/// Records are kept in insertion order, keyed by a sequence number, which
/// gives the same `(event_ts, seq)` ordering as the Postgres backend.
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    retention: Duration,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    events: BTreeMap<u64, Event>,
    index: HashMap<EventId, u64>,
    last_ts: HashMap<TenantId, DateTime<Utc>>,
}

impl Inner {
    fn visible(&self, tenant: &TenantId, id: EventId, now: DateTime<Utc>) -> Option<u64> {
        let seq = *self.index.get(&id)?;
        let event = self.events.get(&seq)?;
        (event.tenant_id == *tenant && !event.is_expired(now)).then_some(seq)
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(default_retention())
    }
}

impl MemoryEventStore {
    /// Creates an empty store. Zero or negative retention is accepted and
    /// makes events invisible as soon as they are appended.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retention,
        }
    }

    /// Number of physically stored events, expired or not.
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: NewEvent) -> StoreResult<Event> {
        let mut inner = self.inner.write().await;

        let id = event.id.unwrap_or_default();
        if inner.index.contains_key(&id) {
            return Err(StoreError::DuplicateKey(id));
        }

        let now = Utc::now();
        let event_ts = match inner.last_ts.get(&event.tenant_id) {
            Some(last) if *last > now => *last,
            _ => now,
        };
        let expire_ts = event_ts
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let stored = Event {
            id,
            tenant_id: event.tenant_id,
            data: event.data,
            event_ts,
            expire_ts,
            delivery: DeliveryState::pending(),
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.last_ts.insert(stored.tenant_id.clone(), event_ts);
        inner.index.insert(id, seq);
        inner.events.insert(seq, stored.clone());

        debug!(
            event_id = %id,
            tenant_id = %stored.tenant_id,
            event_type = %stored.event_type(),
            "Appended event"
        );
        Ok(stored)
    }

    async fn query(&self, tenant: &TenantId, filter: &EventsFilter) -> StoreResult<Vec<Event>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|e| e.tenant_id == *tenant && !e.is_expired(now) && filter.matches(e))
            .skip(to_usize(filter.skip))
            .take(to_usize(filter.effective_limit()))
            .cloned()
            .collect())
    }

    async fn get(&self, tenant: &TenantId, id: EventId) -> StoreResult<Event> {
        let inner = self.inner.read().await;
        inner
            .visible(tenant, id, Utc::now())
            .and_then(|seq| inner.events.get(&seq))
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_status(
        &self,
        tenant: &TenantId,
        id: EventId,
        transition: DeliveryTransition,
    ) -> StoreResult<Event> {
        let mut inner = self.inner.write().await;
        let seq = inner
            .visible(tenant, id, Utc::now())
            .ok_or(StoreError::NotFound(id))?;
        let event = inner.events.get_mut(&seq).ok_or(StoreError::NotFound(id))?;

        let outcome = event.delivery.apply(&transition);
        debug!(
            event_id = %id,
            target = %transition.target_status(),
            ?outcome,
            "Delivery transition"
        );
        Ok(event.clone())
    }

    async fn due_for_delivery(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u64,
    ) -> StoreResult<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut waiting: HashSet<&DeviceId> = HashSet::new();
        let mut due = Vec::new();
        for event in inner.events.values() {
            if due.len() >= to_usize(limit) {
                break;
            }
            if event.tenant_id != *tenant || event.is_expired(now) {
                continue;
            }
            let device = event.device_id();
            if waiting.contains(device) {
                continue;
            }
            if event.delivery.is_backing_off(now, max_attempts) {
                waiting.insert(device);
            } else if event.delivery.is_due(now, max_attempts) {
                due.push(event.clone());
            }
        }
        Ok(due)
    }

    async fn tenants_with_pending(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<Vec<TenantId>> {
        let inner = self.inner.read().await;
        let tenants: BTreeSet<&TenantId> = inner
            .events
            .values()
            .filter(|e| !e.is_expired(now) && e.delivery.is_due(now, max_attempts))
            .map(|e| &e.tenant_id)
            .collect();
        Ok(tenants.into_iter().cloned().collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let expired: Vec<(u64, EventId)> = inner
            .events
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(seq, e)| (*seq, e.id))
            .collect();

        for (seq, id) in &expired {
            inner.events.remove(seq);
            inner.index.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
