//! Device-shadow hub client interface.
//!
//! The hub holds one identity and one shadow document per device. The
//! reconciler talks to it only through [`ShadowClient`]; concrete providers
//! plug in behind the trait. [`HttpShadowClient`] reaches them through an
//! HTTP shadow bridge; [`InMemoryShadowClient`] is provided for tests and
//! local runs.

mod http;
mod memory;

pub use http::HttpShadowClient;
pub use memory::{InMemoryShadowClient, ShadowOp};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shadowsync_events::DeviceStatus;
use shadowsync_id::DeviceId;
use shadowsync_reconcile::{Fields, SyncPolicy};
use thiserror::Error;

use crate::integrations::Credentials;

pub type ShadowResult<T> = Result<T, ShadowError>;

/// Errors reported by a hub.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShadowError {
    #[error("hub request timed out")]
    Timeout,

    #[error("hub throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("hub unavailable: {0}")]
    Unavailable(String),

    #[error("device not found on hub: {0}")]
    NotFound(String),

    /// The write conflicts with the hub's current state (version mismatch,
    /// identity registered with another policy).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("hub rejected the request: {0}")]
    Rejected(String),

    #[error("hub rejected the credentials: {0}")]
    Unauthorized(String),
}

impl ShadowError {
    /// Whether repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShadowError::Timeout | ShadowError::Throttled { .. } | ShadowError::Unavailable(_)
        )
    }
}

/// State pushed to the hub for a device identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpsert {
    pub status: DeviceStatus,
    /// Desired shadow fields, already translated through the sync policy.
    #[serde(default)]
    pub desired: Fields,
}

/// A device identity as the hub sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub device_id: DeviceId,
    pub enabled: bool,
    pub shadow_version: u64,
}

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertedDevice {
    pub device: RemoteDevice,
    /// True when the identity did not exist before the call.
    pub created: bool,
}

/// A full shadow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSnapshot {
    pub device_id: DeviceId,
    pub enabled: bool,
    /// Monotonic per-device version assigned by the hub.
    pub version: u64,
    #[serde(default)]
    pub desired: Fields,
    #[serde(default)]
    pub reported: Fields,
}

/// A desired-side shadow write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowPatch {
    pub desired: Fields,
    /// Apply only if the shadow is still at this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_version: Option<u64>,
}

/// Client for a device-shadow hub.
#[async_trait]
pub trait ShadowClient: Send + Sync {
    /// Creates the device identity or updates it in place.
    async fn upsert_device(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
        state: &DeviceUpsert,
        policy: &SyncPolicy,
    ) -> ShadowResult<UpsertedDevice>;

    /// Removes the device identity and its shadow.
    async fn delete_device(&self, credentials: &Credentials, device_id: &DeviceId)
        -> ShadowResult<()>;

    /// Reads the current shadow document.
    async fn get_device_shadow(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
    ) -> ShadowResult<ShadowSnapshot>;

    /// Writes desired fields and returns the updated document.
    async fn update_device_shadow(
        &self,
        credentials: &Credentials,
        device_id: &DeviceId,
        patch: &ShadowPatch,
    ) -> ShadowResult<ShadowSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ShadowError::Timeout.is_transient());
        assert!(ShadowError::Throttled { retry_after: None }.is_transient());
        assert!(ShadowError::Unavailable("503".into()).is_transient());
        assert!(!ShadowError::NotFound("foo".into()).is_transient());
        assert!(!ShadowError::Conflict("etag".into()).is_transient());
        assert!(!ShadowError::Rejected("bad".into()).is_transient());
        assert!(!ShadowError::Unauthorized("key".into()).is_transient());
    }
}
