//! The stored event record, its delivery state, and the append input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadowsync_id::{DeviceId, EventId, TenantId};

use crate::{DeliveryStatus, EventData, EventError, EventType};

/// Delivery bookkeeping carried on every event.
///
/// Retry state lives on the record rather than in process memory so a
/// restarted dispatcher picks up exactly where the last one stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    #[serde(rename = "delivery_status")]
    pub status: DeliveryStatus,

    /// Number of failed delivery attempts so far.
    pub retry_count: u32,

    /// Earliest time the next attempt may run. `None` on a failed event
    /// means retries were exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeliveryState {
    /// State of a freshly appended event.
    pub fn pending() -> Self {
        Self {
            status: DeliveryStatus::NotDelivered,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// True once the dispatcher has given up on this event.
    pub fn is_exhausted(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.next_attempt_at.is_none()
    }

    /// Whether a delivery attempt may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.status {
            DeliveryStatus::Delivered => false,
            DeliveryStatus::NotDelivered => self.retry_count < max_attempts,
            DeliveryStatus::Failed => {
                self.retry_count < max_attempts
                    && self.next_attempt_at.is_some_and(|at| at <= now)
            }
        }
    }

    /// Whether a failed event is waiting out its backoff at `now` and will be
    /// retried later. Later events of the same device queue behind it.
    pub fn is_backing_off(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == DeliveryStatus::Failed
            && self.retry_count < max_attempts
            && self.next_attempt_at.is_some_and(|at| at > now)
    }

    /// Applies a transition if it is legal from the current state.
    ///
    /// Transitions are conditional and idempotent:
    /// - `Delivered` is accepted from any state; applying it to a delivered
    ///   event changes nothing.
    /// - `Failed { attempt, .. }` is accepted only when `attempt` is exactly
    ///   one past the recorded `retry_count` and the event is not delivered.
    ///   Replaying the same attempt, or a stale one, changes nothing.
    pub fn apply(&mut self, transition: &DeliveryTransition) -> TransitionOutcome {
        match transition {
            DeliveryTransition::Delivered => {
                if self.status == DeliveryStatus::Delivered {
                    return TransitionOutcome::Unchanged;
                }
                self.status = DeliveryStatus::Delivered;
                self.next_attempt_at = None;
                TransitionOutcome::Applied
            }
            DeliveryTransition::Failed {
                attempt,
                error,
                next_attempt_at,
            } => {
                if self.status == DeliveryStatus::Delivered
                    || self.retry_count.checked_add(1) != Some(*attempt)
                {
                    return TransitionOutcome::Unchanged;
                }
                self.status = DeliveryStatus::Failed;
                self.retry_count = *attempt;
                self.next_attempt_at = *next_attempt_at;
                self.last_error = Some(error.clone());
                TransitionOutcome::Applied
            }
        }
    }
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::pending()
    }
}

/// A requested change to an event's delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// The sink accepted the event.
    Delivered,

    /// Delivery attempt number `attempt` (1-based) failed.
    Failed {
        attempt: u32,
        error: String,
        /// When the event becomes eligible again; `None` gives up for good.
        next_attempt_at: Option<DateTime<Utc>>,
    },
}

impl DeliveryTransition {
    pub fn target_status(&self) -> DeliveryStatus {
        match self {
            DeliveryTransition::Delivered => DeliveryStatus::Delivered,
            DeliveryTransition::Failed { .. } => DeliveryStatus::Failed,
        }
    }
}

/// Whether a transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Unchanged,
}

/// A stored domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    pub tenant_id: TenantId,

    #[serde(flatten)]
    pub data: EventData,

    /// Creation time; the ordering key of the log.
    pub event_ts: DateTime<Utc>,

    /// Time after which the event is no longer visible.
    pub expire_ts: DateTime<Utc>,

    #[serde(flatten)]
    pub delivery: DeliveryState,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.data.device_id()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_ts <= now
    }
}

/// Input for appending an event.
///
/// Built through [`NewEvent::builder`], which refuses to produce an event
/// without a tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Caller-supplied ID for deduplication; assigned on append when absent.
    pub id: Option<EventId>,
    pub tenant_id: TenantId,
    pub data: EventData,
}

impl NewEvent {
    pub fn builder() -> NewEventBuilder {
        NewEventBuilder::default()
    }

    /// Shorthand for a tenant-bound event without a caller-supplied ID.
    pub fn new(tenant_id: TenantId, data: EventData) -> Self {
        Self {
            id: None,
            tenant_id,
            data,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Builder for [`NewEvent`].
#[derive(Debug, Default)]
pub struct NewEventBuilder {
    id: Option<EventId>,
    tenant_id: Option<TenantId>,
    data: Option<EventData>,
}

impl NewEventBuilder {
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    /// Builds the event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::MissingTenant` when no tenant was set; there is no
    /// shared default namespace to fall back to.
    pub fn build(self) -> Result<NewEvent, EventError> {
        Ok(NewEvent {
            id: self.id,
            tenant_id: self.tenant_id.ok_or(EventError::MissingTenant)?,
            data: self.data.ok_or(EventError::MissingPayload)?,
        })
    }
}
