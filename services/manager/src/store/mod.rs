//! Tenant-scoped event log with delivery tracking.
//!
//! Every operation takes the tenant explicitly and never touches another
//! tenant's records. Two backends implement [`EventStore`]:
//!
//! - [`MemoryEventStore`]: process-local, for tests and `--in-memory` runs
//! - [`crate::db::PgEventStore`]: Postgres, the production backend
//!
//! Both follow the same rules:
//!
//! - `event_ts` is assigned on append and never decreases within a tenant;
//!   ties are broken by insertion order
//! - `expire_ts = event_ts + retention`; expired events are invisible to every
//!   read even before they are physically purged
//! - delivery transitions are conditional (see [`DeliveryState::apply`])
//!
//! [`DeliveryState::apply`]: shadowsync_events::DeliveryState::apply

mod error;
mod memory;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shadowsync_events::{DeliveryTransition, Event, EventsFilter, NewEvent};
use shadowsync_id::{EventId, TenantId};

/// Default time an event stays visible after it is appended.
pub fn default_retention() -> Duration {
    Duration::days(7)
}

/// Persistent, per-tenant event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event and returns the stored record.
    ///
    /// The store assigns `event_ts`, `expire_ts` and the initial
    /// `not-delivered` state. When the caller supplied an ID that already
    /// exists, nothing is written and `StoreError::DuplicateKey` is returned.
    async fn append(&self, event: NewEvent) -> StoreResult<Event>;

    /// Returns one page of a tenant's unexpired events, ordered by
    /// `event_ts` ascending.
    async fn query(&self, tenant: &TenantId, filter: &EventsFilter) -> StoreResult<Vec<Event>>;

    /// Fetches a single unexpired event.
    async fn get(&self, tenant: &TenantId, id: EventId) -> StoreResult<Event>;

    /// Applies a delivery transition and returns the resulting record.
    ///
    /// A transition that is not legal from the current state (a replayed
    /// attempt, or anything after `delivered`) leaves the record unchanged
    /// and is not an error.
    async fn update_status(
        &self,
        tenant: &TenantId,
        id: EventId,
        transition: DeliveryTransition,
    ) -> StoreResult<Event>;

    /// Events eligible for a delivery attempt at `now`, oldest first.
    async fn due_for_delivery(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u64,
    ) -> StoreResult<Vec<Event>>;

    /// Tenants with at least one event eligible for delivery at `now`.
    async fn tenants_with_pending(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<Vec<TenantId>>;

    /// Physically removes events that expired at or before `now`.
    ///
    /// Returns the number of removed events.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Checks that the backend is reachable.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
