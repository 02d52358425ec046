//! Event type definitions and payloads.
//!
//! Each event type has exactly one payload struct. [`EventData`] ties the two
//! together so a payload can never be stored under the wrong type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shadowsync_id::DeviceId;

use crate::EventError;

// =============================================================================
// Event Type
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const DEVICE_PROVISIONED: &str = "device-provisioned";
    pub const DEVICE_DECOMMISSIONED: &str = "device-decommissioned";
    pub const DEVICE_STATUS_CHANGED: &str = "device-status-changed";
    pub const DEVICE_SHADOW_UPDATED: &str = "device-shadow-updated";
}

/// The closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    DeviceProvisioned,
    DeviceDecommissioned,
    DeviceStatusChanged,
    DeviceShadowUpdated,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::DeviceProvisioned,
        EventType::DeviceDecommissioned,
        EventType::DeviceStatusChanged,
        EventType::DeviceShadowUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeviceProvisioned => event_types::DEVICE_PROVISIONED,
            EventType::DeviceDecommissioned => event_types::DEVICE_DECOMMISSIONED,
            EventType::DeviceStatusChanged => event_types::DEVICE_STATUS_CHANGED,
            EventType::DeviceShadowUpdated => event_types::DEVICE_SHADOW_UPDATED,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// Device status as known to the fleet-management platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Accepted,
    Rejected,
    Pending,
    Preauthorized,
    Noauth,
}

impl DeviceStatus {
    /// Whether the device should be enabled on the hub.
    ///
    /// Only accepted devices may connect; every other status maps to a
    /// disabled hub identity.
    pub fn is_enabled(&self) -> bool {
        matches!(self, DeviceStatus::Accepted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Accepted => "accepted",
            DeviceStatus::Rejected => "rejected",
            DeviceStatus::Pending => "pending",
            DeviceStatus::Preauthorized => "preauthorized",
            DeviceStatus::Noauth => "noauth",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    NotDelivered,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::NotDelivered => "not-delivered",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-delivered" => Ok(DeliveryStatus::NotDelivered),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(EventError::UnknownDeliveryStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProvisionedData {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDecommissionedData {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusChangedData {
    pub device_id: DeviceId,
    pub new_status: DeviceStatus,
    /// Reported shadow fields that changed, when the transition came from drift.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceShadowUpdatedData {
    pub device_id: DeviceId,
    /// Shadow version assigned by the hub after the update.
    pub version: u64,
    pub desired: BTreeMap<String, serde_json::Value>,
}

/// A type-tagged event payload.
///
/// Serializes adjacently tagged as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EventData {
    DeviceProvisioned(DeviceProvisionedData),
    DeviceDecommissioned(DeviceDecommissionedData),
    DeviceStatusChanged(DeviceStatusChangedData),
    DeviceShadowUpdated(DeviceShadowUpdatedData),
}

impl EventData {
    pub fn provisioned(device_id: DeviceId) -> Self {
        EventData::DeviceProvisioned(DeviceProvisionedData { device_id })
    }

    pub fn decommissioned(device_id: DeviceId) -> Self {
        EventData::DeviceDecommissioned(DeviceDecommissionedData { device_id })
    }

    pub fn status_changed(device_id: DeviceId, new_status: DeviceStatus) -> Self {
        EventData::DeviceStatusChanged(DeviceStatusChangedData {
            device_id,
            new_status,
            changes: BTreeMap::new(),
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventData::DeviceProvisioned(_) => EventType::DeviceProvisioned,
            EventData::DeviceDecommissioned(_) => EventType::DeviceDecommissioned,
            EventData::DeviceStatusChanged(_) => EventType::DeviceStatusChanged,
            EventData::DeviceShadowUpdated(_) => EventType::DeviceShadowUpdated,
        }
    }

    /// The device this event is about. Every event type names one device.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            EventData::DeviceProvisioned(d) => &d.device_id,
            EventData::DeviceDecommissioned(d) => &d.device_id,
            EventData::DeviceStatusChanged(d) => &d.device_id,
            EventData::DeviceShadowUpdated(d) => &d.device_id,
        }
    }

    /// Encodes the payload body (without the type tag) for storage.
    pub fn payload_json(&self) -> Result<serde_json::Value, EventError> {
        let value = match self {
            EventData::DeviceProvisioned(d) => serde_json::to_value(d)?,
            EventData::DeviceDecommissioned(d) => serde_json::to_value(d)?,
            EventData::DeviceStatusChanged(d) => serde_json::to_value(d)?,
            EventData::DeviceShadowUpdated(d) => serde_json::to_value(d)?,
        };
        Ok(value)
    }

    /// Decodes a stored payload body for the given type.
    pub fn from_payload(
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Self, EventError> {
        let invalid = |e: serde_json::Error| EventError::InvalidPayload {
            event_type: event_type.as_str(),
            message: e.to_string(),
        };
        let data = match event_type {
            EventType::DeviceProvisioned => {
                EventData::DeviceProvisioned(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventType::DeviceDecommissioned => {
                EventData::DeviceDecommissioned(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventType::DeviceStatusChanged => {
                EventData::DeviceStatusChanged(serde_json::from_value(payload).map_err(invalid)?)
            }
            EventType::DeviceShadowUpdated => {
                EventData::DeviceShadowUpdated(serde_json::from_value(payload).map_err(invalid)?)
            }
        };
        Ok(data)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceId {
        DeviceId::parse(id).unwrap()
    }

    #[test]
    fn test_event_type_strings() {
        for t in EventType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!(matches!(
            "device-exploded".parse::<EventType>(),
            Err(EventError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_delivery_status_strings() {
        assert_eq!(
            serde_json::to_string(&DeliveryStatus::NotDelivered).unwrap(),
            "\"not-delivered\""
        );
        assert_eq!(
            "failed".parse::<DeliveryStatus>().unwrap(),
            DeliveryStatus::Failed
        );
        assert!("lost".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_device_status_enabled() {
        assert!(DeviceStatus::Accepted.is_enabled());
        assert!(!DeviceStatus::Rejected.is_enabled());
        assert!(!DeviceStatus::Noauth.is_enabled());
    }

    #[test]
    fn test_event_data_adjacent_tagging() {
        let data = EventData::status_changed(device("foo"), DeviceStatus::Rejected);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "device-status-changed",
                "data": {"device_id": "foo", "new_status": "rejected"}
            })
        );
        let parsed: EventData = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_payload_roundtrip_per_type() {
        let samples = vec![
            EventData::provisioned(device("baz")),
            EventData::decommissioned(device("bar")),
            EventData::status_changed(device("foo"), DeviceStatus::Accepted),
            EventData::DeviceShadowUpdated(DeviceShadowUpdatedData {
                device_id: device("qux"),
                version: 7,
                desired: BTreeMap::from([("interval".to_string(), serde_json::json!(30))]),
            }),
        ];
        for data in samples {
            let payload = data.payload_json().unwrap();
            assert!(payload.get("type").is_none());
            let decoded = EventData::from_payload(data.event_type(), payload).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_from_payload_rejects_mismatched_shape() {
        let result = EventData::from_payload(
            EventType::DeviceStatusChanged,
            serde_json::json!({"device_id": "foo"}),
        );
        assert!(matches!(
            result,
            Err(EventError::InvalidPayload {
                event_type: "device-status-changed",
                ..
            })
        ));
    }

    #[test]
    fn test_device_id_accessor() {
        let data = EventData::decommissioned(device("bar"));
        assert_eq!(data.device_id().as_str(), "bar");
        assert_eq!(data.event_type(), EventType::DeviceDecommissioned);
    }
}
