//! Event query filters and offset pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadowsync_id::DeviceId;

use crate::{DeliveryStatus, Event, EventType};

/// Page size used when a query does not set a limit.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: u64 = 500;

/// Filter for event queries.
///
/// All criteria are optional and combine with AND. Pagination is by offset:
/// results are ordered by `event_ts` (ties by insertion order), `skip`
/// events are dropped, and at most `limit` are returned. Offsets are not
/// stable across concurrent appends; a page fetched after new events arrive
/// may repeat or miss entries near its boundary. Delivery never relies on
/// offsets, only on status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,

    /// Inclusive lower bound on `event_ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper bound on `event_ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub skip: u64,

    /// Zero means [`DEFAULT_PAGE_SIZE`].
    #[serde(default)]
    pub limit: u64,
}

impl EventsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn time_range(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn page(mut self, skip: u64, limit: u64) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }

    /// The effective page size after defaulting and clamping.
    pub fn effective_limit(&self) -> u64 {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    /// Whether an event satisfies the non-pagination criteria.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(device_id) = &self.device_id {
            if event.device_id() != device_id {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type() != event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.delivery.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.event_ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.event_ts >= until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeliveryState, EventData};
    use chrono::Duration;
    use shadowsync_id::{EventId, TenantId};

    fn event(device: &str, data: fn(DeviceId) -> EventData, ts: DateTime<Utc>) -> Event {
        Event {
            id: EventId::new(),
            tenant_id: TenantId::parse("t1").unwrap(),
            data: data(DeviceId::parse(device).unwrap()),
            event_ts: ts,
            expire_ts: ts + Duration::days(1),
            delivery: DeliveryState::pending(),
        }
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(EventsFilter::new().effective_limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(EventsFilter::new().page(0, 5).effective_limit(), 5);
        assert_eq!(
            EventsFilter::new().page(0, MAX_PAGE_SIZE * 2).effective_limit(),
            MAX_PAGE_SIZE
        );
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let e = event("foo", EventData::provisioned, Utc::now());
        assert!(EventsFilter::new().matches(&e));
    }

    #[test]
    fn test_device_and_type_filters() {
        let e = event("foo", EventData::decommissioned, Utc::now());
        assert!(EventsFilter::new()
            .device(DeviceId::parse("foo").unwrap())
            .matches(&e));
        assert!(!EventsFilter::new()
            .device(DeviceId::parse("bar").unwrap())
            .matches(&e));
        assert!(EventsFilter::new()
            .event_type(EventType::DeviceDecommissioned)
            .matches(&e));
        assert!(!EventsFilter::new()
            .event_type(EventType::DeviceProvisioned)
            .matches(&e));
        assert!(!EventsFilter::new()
            .status(DeliveryStatus::Delivered)
            .matches(&e));
    }

    #[test]
    fn test_time_range_is_half_open() {
        let now = Utc::now();
        let e = event("foo", EventData::provisioned, now);
        assert!(EventsFilter::new().time_range(Some(now), None).matches(&e));
        assert!(!EventsFilter::new().time_range(None, Some(now)).matches(&e));
        assert!(EventsFilter::new()
            .time_range(Some(now - Duration::seconds(1)), Some(now + Duration::seconds(1)))
            .matches(&e));
    }

    #[test]
    fn test_filter_query_string_shape() {
        let filter = EventsFilter::new()
            .event_type(EventType::DeviceStatusChanged)
            .page(1, 1);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["type"], "device-status-changed");
        assert_eq!(json["skip"], 1);
        assert!(json.get("device_id").is_none());
    }
}
