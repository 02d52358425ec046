//! Local device inventory.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use shadowsync_events::DeviceStatus;
use shadowsync_id::{DeviceId, TenantId};
use shadowsync_reconcile::Fields;
use thiserror::Error;

use crate::reconciler::DeviceAttributes;

/// A device the platform knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryDevice {
    pub id: DeviceId,
    /// `None` once the device lost its authentication record; such devices
    /// are removed from the hub.
    pub attributes: Option<DeviceAttributes>,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("device inventory unavailable: {0}")]
    Unavailable(String),
}

/// Source of the devices each tenant should have on its hub.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn tenants(&self) -> Result<Vec<TenantId>, InventoryError>;

    /// One page of a tenant's devices, in a stable order.
    async fn devices(
        &self,
        tenant: &TenantId,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<InventoryDevice>, InventoryError>;
}

/// Inventory held in memory, loaded once.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    tenants: BTreeMap<TenantId, Vec<InventoryDevice>>,
}

#[derive(Deserialize)]
struct TenantEntry {
    tenant_id: TenantId,
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Deserialize)]
struct DeviceEntry {
    id: DeviceId,
    status: Option<DeviceStatus>,
    #[serde(default)]
    fields: Fields,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tenant: TenantId, device: InventoryDevice) {
        self.tenants.entry(tenant).or_default().push(device);
    }

    pub fn len(&self) -> usize {
        self.tenants.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses a JSON array of `{"tenant_id": ..., "devices": [...]}`. A
    /// device entry without a `status` has lost its authentication record.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let entries: Vec<TenantEntry> =
            serde_json::from_str(json).context("invalid inventory document")?;

        let mut inventory = Self::new();
        for entry in entries {
            for device in entry.devices {
                let attributes = device.status.map(|status| DeviceAttributes {
                    status,
                    fields: device.fields,
                });
                inventory.insert(
                    entry.tenant_id.clone(),
                    InventoryDevice {
                        id: device.id,
                        attributes,
                    },
                );
            }
        }
        Ok(inventory)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl DeviceInventory for StaticInventory {
    async fn tenants(&self) -> Result<Vec<TenantId>, InventoryError> {
        Ok(self.tenants.keys().cloned().collect())
    }

    async fn devices(
        &self,
        tenant: &TenantId,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<InventoryDevice>, InventoryError> {
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .tenants
            .get(tenant)
            .map(|devices| devices.iter().skip(skip).take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_from_json() {
        let inventory = StaticInventory::from_json(
            r#"[
                {"tenant_id": "t1", "devices": [
                    {"id": "foo", "status": "accepted", "fields": {"interval": 30}},
                    {"id": "bar", "status": "rejected"},
                    {"id": "gone"}
                ]},
                {"tenant_id": "t2"}
            ]"#,
        )
        .unwrap();
        assert_eq!(inventory.len(), 3);

        let t1 = TenantId::parse("t1").unwrap();
        let page = inventory.devices(&t1, 0, 10).await.unwrap();
        let foo = page[0].attributes.as_ref().unwrap();
        assert_eq!(foo.status, DeviceStatus::Accepted);
        assert_eq!(foo.fields["interval"], json!(30));
        assert!(page[1].attributes.as_ref().unwrap().fields.is_empty());
        assert!(page[2].attributes.is_none());

        let second = inventory.devices(&t1, 2, 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.as_str(), "gone");

        let unknown = TenantId::parse("t3").unwrap();
        assert!(inventory.devices(&unknown, 0, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_from_json_rejects_unknown_status() {
        let err = StaticInventory::from_json(
            r#"[{"tenant_id": "t1", "devices": [{"id": "foo", "status": "enabled"}]}]"#,
        );
        assert!(err.is_err());
    }
}
