//! Tenant integrations with external hubs and sinks.
//!
//! An integration binds a tenant to one provider, the credentials to reach
//! it, and the [`SyncPolicy`] that decides which fields flow in which
//! direction. Integration storage lives elsewhere; this service only looks
//! them up through [`IntegrationLookup`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shadowsync_id::{IntegrationId, TenantId};
use shadowsync_reconcile::SyncPolicy;
use thiserror::Error;

/// Kind of external system an integration talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    IotHub,
    IotCore,
    Webhook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::IotHub => "iot-hub",
            Provider::IotCore => "iot-core",
            Provider::Webhook => "webhook",
        }
    }

    /// Whether the provider hosts device shadows.
    pub fn has_shadows(&self) -> bool {
        !matches!(self, Provider::Webhook)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider credentials. Secrets never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    /// Shared-access connection string for a hub.
    ConnectionString { connection_string: String },

    /// Access key pair for a cloud IoT endpoint.
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        endpoint: Option<String>,
    },

    /// Webhook target with an optional bearer secret.
    Webhook { url: String, secret: Option<String> },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const REDACTED: &str = "<redacted>";
        match self {
            Credentials::ConnectionString { .. } => f
                .debug_struct("ConnectionString")
                .field("connection_string", &REDACTED)
                .finish(),
            Credentials::AccessKey {
                access_key_id,
                region,
                endpoint,
                ..
            } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &REDACTED)
                .field("region", region)
                .field("endpoint", endpoint)
                .finish(),
            Credentials::Webhook { url, secret } => f
                .debug_struct("Webhook")
                .field("url", url)
                .field("secret", &secret.as_ref().map(|_| REDACTED))
                .finish(),
        }
    }
}

/// A tenant's configured integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    #[serde(default)]
    pub id: IntegrationId,
    pub provider: Provider,
    pub credentials: Credentials,
    #[serde(default)]
    pub policy: SyncPolicy,
}

impl Integration {
    pub fn new(provider: Provider, credentials: Credentials) -> Self {
        Self {
            id: IntegrationId::new(),
            provider,
            credentials,
            policy: SyncPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Integration lookup errors.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no {provider} integration for tenant {tenant_id}")]
    NotFound {
        tenant_id: TenantId,
        provider: Provider,
    },

    #[error("integration lookup failed: {0}")]
    Backend(String),
}

/// Resolves a tenant's integration for a provider.
#[async_trait]
pub trait IntegrationLookup: Send + Sync {
    async fn integration(
        &self,
        tenant: &TenantId,
        provider: Provider,
    ) -> Result<Integration, LookupError>;
}

/// Fixed set of integrations, loaded once.
#[derive(Debug, Clone, Default)]
pub struct StaticIntegrations {
    entries: HashMap<(TenantId, Provider), Integration>,
}

#[derive(Deserialize)]
struct IntegrationEntry {
    tenant_id: TenantId,
    #[serde(flatten)]
    integration: Integration,
}

impl StaticIntegrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an integration, replacing any previous one for the same
    /// tenant and provider.
    pub fn insert(&mut self, tenant: TenantId, integration: Integration) {
        self.entries
            .insert((tenant, integration.provider), integration);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses a JSON array of `{"tenant_id": ..., "provider": ..., ...}`.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let entries: Vec<IntegrationEntry> =
            serde_json::from_str(json).context("invalid integrations document")?;

        let mut integrations = Self::new();
        for entry in entries {
            entry
                .integration
                .policy
                .validate()
                .with_context(|| format!("invalid sync policy for tenant {}", entry.tenant_id))?;
            integrations.insert(entry.tenant_id, entry.integration);
        }
        Ok(integrations)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl IntegrationLookup for StaticIntegrations {
    async fn integration(
        &self,
        tenant: &TenantId,
        provider: Provider,
    ) -> Result<Integration, LookupError> {
        self.entries
            .get(&(tenant.clone(), provider))
            .cloned()
            .ok_or_else(|| LookupError::NotFound {
                tenant_id: tenant.clone(),
                provider,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::AccessKey {
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "very-secret".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: None,
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("AKIA123"));
        assert!(!debug.contains("very-secret"));

        let hub = Credentials::ConnectionString {
            connection_string: "HostName=h;SharedAccessKey=k".to_string(),
        };
        assert!(!format!("{hub:?}").contains("SharedAccessKey"));
    }

    #[test]
    fn test_provider_strings() {
        assert_eq!(Provider::IotHub.to_string(), "iot-hub");
        assert_eq!(
            serde_json::to_string(&Provider::IotCore).unwrap(),
            "\"iot-core\""
        );
        assert!(!Provider::Webhook.has_shadows());
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let mut integrations = StaticIntegrations::new();
        integrations.insert(
            tenant("t1"),
            Integration::new(
                Provider::Webhook,
                Credentials::Webhook {
                    url: "http://sink.local/events".to_string(),
                    secret: None,
                },
            ),
        );

        let found = integrations
            .integration(&tenant("t1"), Provider::Webhook)
            .await
            .unwrap();
        assert_eq!(found.provider, Provider::Webhook);

        assert!(matches!(
            integrations.integration(&tenant("t2"), Provider::Webhook).await,
            Err(LookupError::NotFound { .. })
        ));
        assert!(matches!(
            integrations.integration(&tenant("t1"), Provider::IotHub).await,
            Err(LookupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {
                "tenant_id": "t1",
                "provider": "iot-hub",
                "credentials": {"type": "connection-string", "connection_string": "HostName=h"},
                "policy": {"desired": {"poll": "interval"}, "reported": ["firmware"]}
            },
            {
                "tenant_id": "t1",
                "provider": "webhook",
                "credentials": {"type": "webhook", "url": "http://sink.local", "secret": null}
            }
        ]"#;
        let integrations = StaticIntegrations::from_json(json).unwrap();
        assert_eq!(integrations.len(), 2);
    }

    #[test]
    fn test_from_json_rejects_overlapping_policy() {
        let json = r#"[{
            "tenant_id": "t1",
            "provider": "iot-hub",
            "credentials": {"type": "connection-string", "connection_string": "x"},
            "policy": {"desired": {"fw": "firmware"}, "reported": ["firmware"]}
        }]"#;
        assert!(StaticIntegrations::from_json(json).is_err());
    }
}
