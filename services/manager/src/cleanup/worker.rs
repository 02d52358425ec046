use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::store::{EventStore, StoreResult};

#[derive(Debug, Clone)]
pub struct ExpiryWorkerConfig {
    pub interval: Duration,
}

impl Default for ExpiryWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

pub struct ExpiryWorker {
    store: Arc<dyn EventStore>,
    config: ExpiryWorkerConfig,
}

impl ExpiryWorker {
    pub fn new(store: Arc<dyn EventStore>, config: ExpiryWorkerConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting expiry worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to purge expired events");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Expiry worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Deletes every event that has expired by now.
    pub async fn sweep(&self) -> StoreResult<u64> {
        let deleted = self.store.purge_expired(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "Purged expired events");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use shadowsync_events::{EventData, NewEvent};
    use shadowsync_id::{DeviceId, TenantId};

    #[test]
    fn test_config_defaults() {
        let config = ExpiryWorkerConfig::default();
        assert_eq!(config.interval.as_secs(), 3600);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let expired = MemoryEventStore::new(chrono::Duration::zero());
        let live = MemoryEventStore::default();
        for store in [&expired, &live] {
            store
                .append(NewEvent::new(
                    TenantId::parse("t1").unwrap(),
                    EventData::provisioned(DeviceId::parse("foo").unwrap()),
                ))
                .await
                .unwrap();
        }

        let config = ExpiryWorkerConfig::default();
        let sweep_expired = ExpiryWorker::new(Arc::new(expired.clone()), config.clone());
        let sweep_live = ExpiryWorker::new(Arc::new(live.clone()), config);

        assert_eq!(sweep_expired.sweep().await.unwrap(), 1);
        assert!(expired.is_empty().await);
        assert_eq!(sweep_live.sweep().await.unwrap(), 0);
        assert_eq!(live.len().await, 1);
    }
}
