//! In-memory hub for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shadowsync_id::DeviceId;
use shadowsync_reconcile::{Fields, SyncPolicy};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    DeviceUpsert, RemoteDevice, ShadowClient, ShadowError, ShadowPatch, ShadowResult,
    ShadowSnapshot, UpsertedDevice,
};
use crate::integrations::Credentials;

/// Hub operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowOp {
    Upsert,
    Delete,
    GetShadow,
    UpdateShadow,
}

#[derive(Default)]
struct HubState {
    devices: HashMap<DeviceId, ShadowSnapshot>,
    failures: HashMap<ShadowOp, VecDeque<ShadowError>>,
    calls: HashMap<ShadowOp, usize>,
}

impl HubState {
    /// Counts the call and pops an injected failure, if any.
    fn begin(&mut self, op: ShadowOp) -> ShadowResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Hub that keeps shadows in memory.
///
/// Every call is counted; failures can be queued per operation and are
/// returned in order before the call touches any state.
#[derive(Clone, Default)]
pub struct InMemoryShadowClient {
    state: Arc<Mutex<HubState>>,
    latency: Option<Duration>,
}

impl InMemoryShadowClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues an error for the next call of `op`.
    pub async fn fail_next(&self, op: ShadowOp, err: ShadowError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Number of calls made for `op`, including failed ones.
    pub async fn calls(&self, op: ShadowOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Current shadow for a device, if registered.
    pub async fn shadow(&self, device_id: &DeviceId) -> Option<ShadowSnapshot> {
        self.state.lock().await.devices.get(device_id).cloned()
    }

    /// Simulates the device reporting state through the hub.
    ///
    /// Returns the new shadow version, or `None` for an unknown device.
    pub async fn report(&self, device_id: &DeviceId, reported: Fields) -> Option<u64> {
        let mut state = self.state.lock().await;
        let shadow = state.devices.get_mut(device_id)?;
        shadow.reported.extend(reported);
        shadow.version += 1;
        Some(shadow.version)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ShadowClient for InMemoryShadowClient {
    async fn upsert_device(
        &self,
        _credentials: &Credentials,
        device_id: &DeviceId,
        upsert: &DeviceUpsert,
        _policy: &SyncPolicy,
    ) -> ShadowResult<UpsertedDevice> {
        self.state.lock().await.begin(ShadowOp::Upsert)?;
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        let enabled = upsert.status.is_enabled();
        let created = !state.devices.contains_key(device_id);
        let shadow = state
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| ShadowSnapshot {
                device_id: device_id.clone(),
                enabled,
                version: 0,
                desired: Fields::new(),
                reported: Fields::new(),
            });
        shadow.enabled = enabled;
        shadow.desired.extend(upsert.desired.clone());
        shadow.version += 1;

        debug!(device_id = %device_id, created, version = shadow.version, "[MOCK] Upserted device");

        Ok(UpsertedDevice {
            device: RemoteDevice {
                device_id: device_id.clone(),
                enabled,
                shadow_version: shadow.version,
            },
            created,
        })
    }

    async fn delete_device(
        &self,
        _credentials: &Credentials,
        device_id: &DeviceId,
    ) -> ShadowResult<()> {
        self.state.lock().await.begin(ShadowOp::Delete)?;
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        state
            .devices
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| ShadowError::NotFound(device_id.to_string()))
    }

    async fn get_device_shadow(
        &self,
        _credentials: &Credentials,
        device_id: &DeviceId,
    ) -> ShadowResult<ShadowSnapshot> {
        self.state.lock().await.begin(ShadowOp::GetShadow)?;
        self.simulate_latency().await;

        self.shadow(device_id)
            .await
            .ok_or_else(|| ShadowError::NotFound(device_id.to_string()))
    }

    async fn update_device_shadow(
        &self,
        _credentials: &Credentials,
        device_id: &DeviceId,
        patch: &ShadowPatch,
    ) -> ShadowResult<ShadowSnapshot> {
        self.state.lock().await.begin(ShadowOp::UpdateShadow)?;
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        let shadow = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ShadowError::NotFound(device_id.to_string()))?;

        if let Some(expected) = patch.if_version {
            if expected != shadow.version {
                return Err(ShadowError::Conflict(format!(
                    "shadow is at version {}, expected {expected}",
                    shadow.version
                )));
            }
        }

        shadow.desired.extend(patch.desired.clone());
        shadow.version += 1;
        Ok(shadow.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shadowsync_events::DeviceStatus;

    fn creds() -> Credentials {
        Credentials::ConnectionString {
            connection_string: "HostName=test".to_string(),
        }
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::parse(id).unwrap()
    }

    fn upsert(status: DeviceStatus) -> DeviceUpsert {
        DeviceUpsert {
            status,
            desired: Fields::from([("interval".to_string(), json!(30))]),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let hub = InMemoryShadowClient::new();
        let policy = SyncPolicy::default();

        let first = hub
            .upsert_device(&creds(), &device("foo"), &upsert(DeviceStatus::Accepted), &policy)
            .await
            .unwrap();
        assert!(first.created);
        assert!(first.device.enabled);

        let second = hub
            .upsert_device(&creds(), &device("foo"), &upsert(DeviceStatus::Rejected), &policy)
            .await
            .unwrap();
        assert!(!second.created);
        assert!(!second.device.enabled);
        assert!(second.device.shadow_version > first.device.shadow_version);
        assert_eq!(hub.calls(ShadowOp::Upsert).await, 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_returned_once() {
        let hub = InMemoryShadowClient::new();
        hub.fail_next(ShadowOp::Delete, ShadowError::Timeout).await;

        assert_eq!(
            hub.delete_device(&creds(), &device("foo")).await,
            Err(ShadowError::Timeout)
        );
        assert!(matches!(
            hub.delete_device(&creds(), &device("foo")).await,
            Err(ShadowError::NotFound(_))
        ));
        assert_eq!(hub.calls(ShadowOp::Delete).await, 2);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let hub = InMemoryShadowClient::new();
        hub.upsert_device(
            &creds(),
            &device("foo"),
            &upsert(DeviceStatus::Accepted),
            &SyncPolicy::default(),
        )
        .await
        .unwrap();
        hub.report(&device("foo"), Fields::from([("firmware".to_string(), json!("1.1"))]))
            .await
            .unwrap();

        let patch = ShadowPatch {
            desired: Fields::from([("interval".to_string(), json!(60))]),
            if_version: Some(1),
        };
        assert!(matches!(
            hub.update_device_shadow(&creds(), &device("foo"), &patch).await,
            Err(ShadowError::Conflict(_))
        ));

        let current = hub.shadow(&device("foo")).await.unwrap();
        let patch = ShadowPatch {
            if_version: Some(current.version),
            ..patch
        };
        let updated = hub
            .update_device_shadow(&creds(), &device("foo"), &patch)
            .await
            .unwrap();
        assert_eq!(updated.desired["interval"], json!(60));
        assert_eq!(updated.reported["firmware"], json!("1.1"));
    }
}
