//! Fleet sync.
//!
//! Walks every tenant's device inventory in batches and brings each shadow
//! hub integration in line with it:
//!
//! - devices that lost their authentication record are removed from the hub
//! - devices missing on the hub are provisioned
//! - devices whose hub enabled state disagrees with their status are updated
//!
//! Every change goes through [`ShadowReconciler`], so it is recorded in the
//! event log the same way as a single-device sync. Devices already in step
//! are left alone and produce no event.

mod inventory;

pub use inventory::{DeviceInventory, InventoryDevice, InventoryError, StaticInventory};

use std::sync::Arc;

use shadowsync_id::TenantId;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::integrations::{Integration, IntegrationLookup, LookupError, Provider};
use crate::reconciler::{ShadowReconciler, SyncContext, SyncError};

/// Providers that host device shadows, in the order they are synced.
const SHADOW_PROVIDERS: [Provider; 2] = [Provider::IotHub, Provider::IotCore];

pub const DEFAULT_BATCH_SIZE: u64 = 100;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("fleet sync cancelled")]
    Cancelled,
}

/// Per-device outcomes of a fleet sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub provisioned: u64,
    pub updated: u64,
    pub removed: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl FleetReport {
    pub fn merge(&mut self, other: &FleetReport) {
        self.provisioned += other.provisioned;
        self.updated += other.updated;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }

    pub fn changed(&self) -> u64 {
        self.provisioned + self.updated + self.removed
    }
}

enum Outcome {
    Provisioned,
    Updated,
    Removed,
    Unchanged,
}

/// Reconciles whole tenants against the device inventory.
#[derive(Clone)]
pub struct FleetSync {
    reconciler: ShadowReconciler,
    inventory: Arc<dyn DeviceInventory>,
    integrations: Arc<dyn IntegrationLookup>,
    batch_size: u64,
}

impl FleetSync {
    pub fn new(
        reconciler: ShadowReconciler,
        inventory: Arc<dyn DeviceInventory>,
        integrations: Arc<dyn IntegrationLookup>,
    ) -> Self {
        Self {
            reconciler,
            inventory,
            integrations,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Devices fetched from the inventory per page. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Syncs every tenant in the inventory.
    ///
    /// A tenant whose inventory or integration lookup fails is logged and
    /// skipped; cancellation stops the run.
    pub async fn sync_all(&self, ctx: &SyncContext) -> Result<FleetReport, FleetError> {
        let mut report = FleetReport::default();
        for tenant in self.inventory.tenants().await? {
            match self.sync_tenant(ctx, &tenant).await {
                Ok(tenant_report) => report.merge(&tenant_report),
                Err(FleetError::Cancelled) => return Err(FleetError::Cancelled),
                Err(err) => {
                    warn!(tenant_id = %tenant, error = %err, "Fleet sync failed for tenant");
                }
            }
        }
        Ok(report)
    }

    /// Syncs one tenant against each of its shadow hub integrations.
    #[instrument(skip_all, fields(tenant_id = %tenant))]
    pub async fn sync_tenant(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
    ) -> Result<FleetReport, FleetError> {
        let mut report = FleetReport::default();
        for provider in SHADOW_PROVIDERS {
            let integration = match self.integrations.integration(tenant, provider).await {
                Ok(integration) => integration,
                Err(LookupError::NotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            };
            let hub_report = self.sync_integration(ctx, tenant, &integration).await?;
            report.merge(&hub_report);
        }

        if report == FleetReport::default() {
            debug!("No shadow integration or no devices");
        } else {
            info!(
                provisioned = report.provisioned,
                updated = report.updated,
                removed = report.removed,
                unchanged = report.unchanged,
                failed = report.failed,
                "Tenant fleet synced"
            );
        }
        Ok(report)
    }

    async fn sync_integration(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
    ) -> Result<FleetReport, FleetError> {
        let mut report = FleetReport::default();
        let mut skip = 0;
        loop {
            if ctx.is_done() {
                return Err(FleetError::Cancelled);
            }
            let batch = self
                .inventory
                .devices(tenant, skip, self.batch_size)
                .await?;

            for device in &batch {
                match self.sync_device(ctx, tenant, integration, device).await {
                    Ok(Outcome::Provisioned) => report.provisioned += 1,
                    Ok(Outcome::Updated) => report.updated += 1,
                    Ok(Outcome::Removed) => report.removed += 1,
                    Ok(Outcome::Unchanged) => report.unchanged += 1,
                    Err(SyncError::Cancelled) => return Err(FleetError::Cancelled),
                    Err(err) => {
                        report.failed += 1;
                        warn!(
                            device_id = %device.id,
                            provider = %integration.provider,
                            error = %err,
                            retryable = err.is_retryable(),
                            "Device sync failed"
                        );
                    }
                }
            }

            if (batch.len() as u64) < self.batch_size {
                return Ok(report);
            }
            skip += self.batch_size;
        }
    }

    async fn sync_device(
        &self,
        ctx: &SyncContext,
        tenant: &TenantId,
        integration: &Integration,
        device: &InventoryDevice,
    ) -> Result<Outcome, SyncError> {
        let on_hub = match self.reconciler.get_shadow(ctx, integration, &device.id).await {
            Ok(shadow) => Some(shadow),
            Err(SyncError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        match (&device.attributes, on_hub) {
            (None, None) => Ok(Outcome::Unchanged),
            (None, Some(_)) => {
                self.reconciler
                    .sync_device_down(ctx, tenant, integration, &device.id)
                    .await?;
                Ok(Outcome::Removed)
            }
            (Some(attributes), None) => {
                self.reconciler
                    .sync_device_up(ctx, tenant, integration, &device.id, attributes)
                    .await?;
                Ok(Outcome::Provisioned)
            }
            (Some(attributes), Some(shadow)) if shadow.enabled != attributes.status.is_enabled() => {
                self.reconciler
                    .sync_device_up(ctx, tenant, integration, &device.id, attributes)
                    .await?;
                Ok(Outcome::Updated)
            }
            (Some(_), Some(_)) => Ok(Outcome::Unchanged),
        }
    }
}
