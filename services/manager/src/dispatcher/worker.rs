//! Background delivery loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shadowsync_id::TenantId;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{DeliveryReport, EventDispatcher, EventSink, RecordingSink, WebhookSink};
use crate::integrations::{IntegrationLookup, LookupError, Provider};

/// Picks the sink a tenant's events go to.
#[async_trait]
pub trait SinkResolver: Send + Sync {
    /// `None` leaves the tenant's events pending.
    async fn sink_for(&self, tenant: &TenantId) -> Option<Arc<dyn EventSink>>;
}

#[async_trait]
impl SinkResolver for RecordingSink {
    async fn sink_for(&self, _tenant: &TenantId) -> Option<Arc<dyn EventSink>> {
        Some(Arc::new(self.clone()))
    }
}

/// Resolves each tenant's webhook integration, falling back to a shared
/// sink for tenants without one.
#[derive(Clone)]
pub struct IntegrationSinks {
    integrations: Arc<dyn IntegrationLookup>,
    client: reqwest::Client,
    fallback: Option<Arc<dyn EventSink>>,
}

impl IntegrationSinks {
    pub fn new(integrations: Arc<dyn IntegrationLookup>, client: reqwest::Client) -> Self {
        Self {
            integrations,
            client,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.fallback = Some(sink);
        self
    }
}

#[async_trait]
impl SinkResolver for IntegrationSinks {
    async fn sink_for(&self, tenant: &TenantId) -> Option<Arc<dyn EventSink>> {
        match self.integrations.integration(tenant, Provider::Webhook).await {
            Ok(integration) => {
                match WebhookSink::from_credentials(self.client.clone(), &integration.credentials) {
                    Some(sink) => Some(Arc::new(sink)),
                    None => {
                        warn!(
                            tenant_id = %tenant,
                            integration_id = %integration.id,
                            "Webhook integration has no webhook credentials"
                        );
                        self.fallback.clone()
                    }
                }
            }
            Err(LookupError::NotFound { .. }) => self.fallback.clone(),
            Err(e) => {
                warn!(tenant_id = %tenant, error = %e, "Failed to resolve webhook integration");
                None
            }
        }
    }
}

/// Dispatch worker configuration.
#[derive(Debug, Clone)]
pub struct DispatchWorkerConfig {
    /// Time between delivery passes.
    pub interval: Duration,
}

impl Default for DispatchWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Periodically delivers pending events for every tenant.
pub struct DispatchWorker {
    dispatcher: EventDispatcher,
    sinks: Arc<dyn SinkResolver>,
    config: DispatchWorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        dispatcher: EventDispatcher,
        sinks: Arc<dyn SinkResolver>,
        config: DispatchWorkerConfig,
    ) -> Self {
        Self {
            dispatcher,
            sinks,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_attempts = self.dispatcher.config().backoff.max_attempts,
            "Starting dispatch worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one pass over every tenant with pending events.
    pub async fn run_once(&self) -> DeliveryReport {
        let now = Utc::now();
        let max_attempts = self.dispatcher.config().backoff.max_attempts;

        let tenants = match self
            .dispatcher
            .store()
            .tenants_with_pending(now, max_attempts)
            .await
        {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to list tenants with pending events");
                return DeliveryReport::default();
            }
        };

        let mut total = DeliveryReport::default();
        for tenant in tenants {
            let Some(sink) = self.sinks.sink_for(&tenant).await else {
                debug!(tenant_id = %tenant, "No sink for tenant, leaving events pending");
                continue;
            };

            match self.dispatcher.deliver_at(&tenant, sink.as_ref(), now).await {
                Ok(report) => total.merge(report),
                Err(e) => {
                    error!(tenant_id = %tenant, error = %e, "Delivery pass failed");
                }
            }
        }
        total
    }
}
