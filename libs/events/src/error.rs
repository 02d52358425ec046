//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when building or decoding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event was built without a tenant.
    #[error("event has no tenant binding")]
    MissingTenant,

    /// The event was built without a payload.
    #[error("event has no payload")]
    MissingPayload,

    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The delivery status is unknown.
    #[error("unknown delivery status: {0}")]
    UnknownDeliveryStatus(String),

    /// The event payload does not match its type.
    #[error("invalid payload for {event_type}: {message}")]
    InvalidPayload {
        event_type: &'static str,
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
