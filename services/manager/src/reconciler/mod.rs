//! Shadow reconciler.
//!
//! Pushes local device changes to a tenant's hub and records each effective
//! change in the event log. The rule for every operation is the same: the
//! hub call happens first, and an event is appended only after it succeeds.
//! A failed or cancelled call leaves the log untouched.
//!
//! ## Deduplication
//!
//! When the caller supplies an occurrence key through [`SyncContext`], the
//! event ID is derived from it, so retrying the same occurrence after a
//! partial failure appends at most once. Without one, shadow-update events
//! are keyed by the hub's shadow version and drift events by the observed
//! version plus a digest of the drifted fields.

mod error;

pub use error::SyncError;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shadowsync_events::{
    DeviceShadowUpdatedData, DeviceStatus, DeviceStatusChangedData, Event, EventData, EventType,
    EventsFilter, NewEvent, MAX_PAGE_SIZE,
};
use shadowsync_id::{DeviceId, EventId, TenantId};
use shadowsync_reconcile::{detect_drift, DriftOutcome, Fields, StateDigest};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::integrations::Integration;
use crate::shadow::{DeviceUpsert, ShadowClient, ShadowPatch, ShadowResult, ShadowSnapshot};
use crate::store::{EventStore, StoreError};

/// Per-call deadline, cancellation and occurrence key.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    occurrence: Option<String>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Identifies the triggering occurrence for event deduplication.
    pub fn with_occurrence(mut self, key: impl Into<String>) -> Self {
        self.occurrence = Some(key.into());
        self
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.is_done() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs a hub call, abandoning it when the context is cancelled or its
    /// deadline passes.
    async fn run<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = ShadowResult<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            _ = deadline => Err(SyncError::Cancelled),
            result = call => result.map_err(SyncError::from),
        }
    }

    fn event_id(&self, parts: [&str; 3], fallback: Option<String>) -> Option<EventId> {
        self.occurrence
            .clone()
            .or(fallback)
            .map(|key| EventId::derived([parts[0], parts[1], parts[2], key.as_str()]))
    }
}

/// Local attributes of a device that are pushed to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub status: DeviceStatus,
    #[serde(default)]
    pub fields: Fields,
}

/// What the platform last knew about a device's hub-side state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: DeviceId,
    pub status: DeviceStatus,
    #[serde(default)]
    pub reported: Fields,
    /// Shadow version `reported` was taken from.
    #[serde(default)]
    pub shadow_version: Option<u64>,
}

/// Keeps hub shadows in step with local device state.
#[derive(Clone)]
pub struct ShadowReconciler {
    client: Arc<dyn ShadowClient>,
    store: Arc<dyn EventStore>,
}

impl ShadowReconciler {
    pub fn new(client: Arc<dyn ShadowClient>, store: Arc<dyn EventStore>) -> Self {
        Self { client, store }
    }

    /// Creates or updates the device on the hub.
    ///
    /// Records `device-provisioned` when the hub identity was created and
    /// `device-status-changed` when it already existed. A call carrying an
    /// occurrence key may be the retry of an attempt whose upsert landed but
    /// whose append did not; it records `device-provisioned` unless the log
    /// already shows the device as provisioned.
    #[instrument(skip_all, fields(tenant_id = %tenant, device_id = %device_id, provider = %integration.provider))]
    pub async fn sync_device_up(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
        device_id: &DeviceId,
        attributes: &DeviceAttributes,
    ) -> Result<Event, SyncError> {
        check_integration(integration)?;

        let upsert = DeviceUpsert {
            status: attributes.status,
            desired: integration.policy.desired_patch(&attributes.fields),
        };
        let result = ctx
            .run(self.client.upsert_device(
                &integration.credentials,
                device_id,
                &upsert,
                &integration.policy,
            ))
            .await?;
        ctx.check()?;

        let first_seen = result.created
            || (ctx.occurrence.is_some() && !self.provisioned_in_log(tenant, device_id).await?);
        let data = if first_seen {
            EventData::provisioned(device_id.clone())
        } else {
            EventData::status_changed(device_id.clone(), attributes.status)
        };
        let id = ctx.event_id([tenant.as_str(), device_id.as_str(), "sync-up"], None);
        let event = self.record(tenant, id, data).await?;

        info!(
            event_id = %event.id,
            created = result.created,
            first_seen,
            enabled = result.device.enabled,
            "Device synced to hub"
        );
        Ok(event)
    }

    /// Removes the device from the hub and records `device-decommissioned`.
    ///
    /// A device the hub does not know counts as already removed.
    #[instrument(skip_all, fields(tenant_id = %tenant, device_id = %device_id, provider = %integration.provider))]
    pub async fn sync_device_down(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
        device_id: &DeviceId,
    ) -> Result<Event, SyncError> {
        check_integration(integration)?;

        match ctx
            .run(
                self.client
                    .delete_device(&integration.credentials, device_id),
            )
            .await
        {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => {
                debug!("Device already absent from hub");
            }
            Err(err) => return Err(err),
        }
        ctx.check()?;

        let id = ctx.event_id([tenant.as_str(), device_id.as_str(), "sync-down"], None);
        let event = self
            .record(tenant, id, EventData::decommissioned(device_id.clone()))
            .await?;

        info!(event_id = %event.id, "Device removed from hub");
        Ok(event)
    }

    /// Compares an observed shadow with the known device state.
    ///
    /// Returns the recorded `device-status-changed` event when tracked
    /// reported fields drifted, or `None` when the shadow is in sync or the
    /// snapshot is older than the known state. Makes no hub calls.
    #[instrument(skip_all, fields(tenant_id = %tenant, device_id = %known.id, observed_version = observed.version))]
    pub async fn reconcile_shadow_drift(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
        known: &KnownDevice,
        observed: &ShadowSnapshot,
    ) -> Result<Option<Event>, SyncError> {
        check_integration(integration)?;
        if observed.device_id != known.id {
            return Err(SyncError::Validation(format!(
                "snapshot is for device {}, expected {}",
                observed.device_id, known.id
            )));
        }

        let changes = match detect_drift(
            &integration.policy,
            &known.reported,
            known.shadow_version,
            &observed.reported,
            observed.version,
        ) {
            DriftOutcome::InSync => {
                debug!("Shadow in sync");
                return Ok(None);
            }
            DriftOutcome::Stale { known, observed } => {
                debug!(known, observed, "Ignoring stale shadow snapshot");
                return Ok(None);
            }
            DriftOutcome::Drifted(changes) => changes,
        };
        ctx.check()?;

        let fields: Vec<String> = changes.keys().cloned().collect();
        let digest = StateDigest::from_json(&serde_json::Value::Object(
            changes.clone().into_iter().collect(),
        ));
        let data = EventData::DeviceStatusChanged(DeviceStatusChangedData {
            device_id: known.id.clone(),
            new_status: known.status,
            changes,
        });
        let id = ctx.event_id(
            [tenant.as_str(), known.id.as_str(), "drift"],
            Some(format!("{}:{digest}", observed.version)),
        );
        let event = self.record(tenant, id, data).await?;

        info!(event_id = %event.id, ?fields, "Shadow drift recorded");
        Ok(Some(event))
    }

    /// Writes desired fields to the device shadow and records
    /// `device-shadow-updated`.
    ///
    /// Reported fields are dropped from the patch; a patch left empty is
    /// rejected without calling the hub.
    #[instrument(skip_all, fields(tenant_id = %tenant, device_id = %device_id, provider = %integration.provider))]
    pub async fn update_shadow(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
        device_id: &DeviceId,
        desired: &Fields,
        if_version: Option<u64>,
    ) -> Result<Event, SyncError> {
        check_integration(integration)?;

        let patch = ShadowPatch {
            desired: integration.policy.filter_desired(desired),
            if_version,
        };
        if patch.desired.is_empty() {
            return Err(SyncError::Validation(
                "patch contains no desired fields".to_string(),
            ));
        }

        let snapshot = ctx
            .run(
                self.client
                    .update_device_shadow(&integration.credentials, device_id, &patch),
            )
            .await?;
        ctx.check()?;

        let data = EventData::DeviceShadowUpdated(DeviceShadowUpdatedData {
            device_id: device_id.clone(),
            version: snapshot.version,
            desired: patch.desired,
        });
        let id = ctx.event_id(
            [tenant.as_str(), device_id.as_str(), "shadow-update"],
            Some(snapshot.version.to_string()),
        );
        let event = self.record(tenant, id, data).await?;

        info!(event_id = %event.id, version = snapshot.version, "Shadow updated");
        Ok(event)
    }

    /// Reads the current shadow from the hub. Records nothing.
    pub async fn get_shadow(
        &self,
        ctx: &SyncContext,
        integration: &Integration,
        device_id: &DeviceId,
    ) -> Result<ShadowSnapshot, SyncError> {
        check_integration(integration)?;
        ctx.run(
            self.client
                .get_device_shadow(&integration.credentials, device_id),
        )
        .await
    }

    /// Whether the device's latest lifecycle event in the log is
    /// `device-provisioned`.
    async fn provisioned_in_log(
        &self,
        tenant: &TenantId,
        device_id: &DeviceId,
    ) -> Result<bool, SyncError> {
        let mut provisioned = false;
        let mut skip = 0;
        loop {
            let filter = EventsFilter::new()
                .device(device_id.clone())
                .page(skip, MAX_PAGE_SIZE);
            let page = self.store.query(tenant, &filter).await?;
            for event in &page {
                match event.event_type() {
                    EventType::DeviceProvisioned => provisioned = true,
                    EventType::DeviceDecommissioned => provisioned = false,
                    _ => {}
                }
            }
            if (page.len() as u64) < MAX_PAGE_SIZE {
                return Ok(provisioned);
            }
            skip += MAX_PAGE_SIZE;
        }
    }

    /// Appends an event, treating an already-recorded occurrence as success.
    async fn record(
        &self,
        tenant: &TenantId,
        id: Option<EventId>,
        data: EventData,
    ) -> Result<Event, SyncError> {
        let mut builder = NewEvent::builder().tenant(tenant.clone()).data(data);
        if let Some(id) = id {
            builder = builder.id(id);
        }
        let event = builder
            .build()
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        match self.store.append(event).await {
            Ok(event) => Ok(event),
            Err(StoreError::DuplicateKey(id)) => {
                debug!(event_id = %id, "Occurrence already recorded");
                Ok(self.store.get(tenant, id).await?)
            }
            Err(err) => {
                warn!(error = %err, "Hub change applied but event was not recorded");
                Err(err.into())
            }
        }
    }
}

fn check_integration(integration: &Integration) -> Result<(), SyncError> {
    if !integration.provider.has_shadows() {
        return Err(SyncError::Validation(format!(
            "{} integrations do not host device shadows",
            integration.provider
        )));
    }
    integration
        .policy
        .validate()
        .map_err(|e| SyncError::Validation(e.to_string()))
}
