//! shadowsync
//!
//! Runs the event dispatcher, the expiry sweeper and the health endpoints
//! for the device shadow-sync event log, and syncs whole device fleets to
//! their shadow hubs on demand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shadowsync_manager::{
    api,
    cleanup::{ExpiryWorker, ExpiryWorkerConfig},
    config::Config,
    db::Database,
    dispatcher::{
        DispatchWorker, DispatchWorkerConfig, EventDispatcher, EventSink, IntegrationSinks,
        WebhookSink,
    },
    fleet::{FleetSync, StaticInventory, DEFAULT_BATCH_SIZE},
    integrations::StaticIntegrations,
    reconciler::{ShadowReconciler, SyncContext},
    shadow::{HttpShadowClient, InMemoryShadowClient, ShadowClient},
    state::AppState,
    store::{EventStore, MemoryEventStore},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Device shadow-sync event log service.
#[derive(Debug, Parser)]
#[command(name = "shadowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the service (default).
    Server {
        /// Keep events in process memory instead of Postgres.
        #[arg(long, env = "SHADOWSYNC_IN_MEMORY")]
        in_memory: bool,
    },

    /// Apply database migrations and exit.
    Migrate,

    /// Bring every tenant's shadow hub in line with the device inventory.
    SyncDevices {
        /// Devices fetched from the inventory per batch.
        #[arg(long, env = "SHADOWSYNC_SYNC_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE,
              value_parser = clap::value_parser!(u64).range(1..))]
        batch_size: u64,

        /// Inventory JSON file; defaults to SHADOWSYNC_INVENTORY_FILE.
        #[arg(long)]
        inventory: Option<PathBuf>,

        /// Keep events in process memory and use an in-memory hub.
        #[arg(long, env = "SHADOWSYNC_IN_MEMORY")]
        in_memory: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to SHADOWSYNC_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command.unwrap_or(Commands::Server { in_memory: false }) {
        Commands::Server { in_memory } => serve(config, in_memory).await,
        Commands::Migrate => migrate(config).await,
        Commands::SyncDevices {
            batch_size,
            inventory,
            in_memory,
        } => sync_devices(config, batch_size, inventory, in_memory).await,
    }
}

async fn migrate(config: Config) -> Result<()> {
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    info!("Migrations applied");
    Ok(())
}

async fn open_store(config: &Config, in_memory: bool) -> Result<Arc<dyn EventStore>> {
    if in_memory {
        warn!("Using in-memory event store; events are lost on restart");
        return Ok(Arc::new(MemoryEventStore::new(config.event_retention)));
    }

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    Ok(Arc::new(db.event_store(config.event_retention)))
}

fn load_integrations(config: &Config) -> Result<StaticIntegrations> {
    match &config.integrations_file {
        Some(path) => {
            let integrations = StaticIntegrations::from_file(path)?;
            info!(count = integrations.len(), path = %path.display(), "Loaded integrations");
            Ok(integrations)
        }
        None => Ok(StaticIntegrations::new()),
    }
}

async fn sync_devices(
    config: Config,
    batch_size: u64,
    inventory: Option<PathBuf>,
    in_memory: bool,
) -> Result<()> {
    let path = inventory
        .or_else(|| config.inventory_file.clone())
        .ok_or_else(|| anyhow!("no inventory given; pass --inventory or set SHADOWSYNC_INVENTORY_FILE"))?;
    let inventory = StaticInventory::from_file(&path)?;
    info!(devices = inventory.len(), path = %path.display(), "Loaded device inventory");

    let hub: Arc<dyn ShadowClient> = match (&config.shadow_bridge_url, in_memory) {
        (_, true) => {
            warn!("Using in-memory shadow hub; hub changes are lost on exit");
            Arc::new(InMemoryShadowClient::new())
        }
        (Some(url), false) => {
            let http = reqwest::Client::builder()
                .timeout(config.shadow_bridge_timeout)
                .build()?;
            info!(url = %url, "Using shadow bridge");
            Arc::new(HttpShadowClient::new(http, url.clone()))
        }
        (None, false) => {
            return Err(anyhow!(
                "no shadow hub configured; set SHADOWSYNC_SHADOW_BRIDGE_URL or pass --in-memory"
            ))
        }
    };

    let store = open_store(&config, in_memory).await?;
    let fleet = FleetSync::new(
        ShadowReconciler::new(hub, store),
        Arc::new(inventory),
        Arc::new(load_integrations(&config)?),
    )
    .with_batch_size(batch_size);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                cancel.cancel();
            }
        }
    });

    let report = fleet
        .sync_all(&SyncContext::new().with_cancellation(cancel))
        .await?;
    info!(
        provisioned = report.provisioned,
        updated = report.updated,
        removed = report.removed,
        unchanged = report.unchanged,
        failed = report.failed,
        "Fleet sync complete"
    );
    if report.failed > 0 {
        return Err(anyhow!("{} devices failed to sync", report.failed));
    }
    Ok(())
}

async fn serve(config: Config, in_memory: bool) -> Result<()> {
    info!("Starting shadowsync");
    info!(
        listen_addr = %config.listen_addr,
        retention_secs = config.event_retention.num_seconds(),
        "Configuration loaded"
    );

    let store = open_store(&config, in_memory).await?;

    let integrations = load_integrations(&config)?;

    let http = reqwest::Client::builder()
        .timeout(config.webhook_timeout)
        .build()?;

    let mut sinks = IntegrationSinks::new(Arc::new(integrations), http.clone());
    if let Some(url) = &config.webhook_url {
        info!(url = %url, "Default webhook sink configured");
        let fallback: Arc<dyn EventSink> = Arc::new(WebhookSink::new(http, url.clone()));
        sinks = sinks.with_fallback(fallback);
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatch_worker = DispatchWorker::new(
        EventDispatcher::new(store.clone(), config.dispatch.clone()),
        Arc::new(sinks),
        DispatchWorkerConfig {
            interval: config.dispatch_interval,
        },
    );
    let dispatch_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            dispatch_worker.run(shutdown_rx).await;
        }
    });

    let expiry_worker = ExpiryWorker::new(
        store.clone(),
        ExpiryWorkerConfig {
            interval: config.expiry_sweep_interval,
        },
    );
    let expiry_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            expiry_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(store));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, dispatch_handle).await {
        warn!(error = %e, "Dispatch worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, expiry_handle).await {
        warn!(error = %e, "Expiry worker did not shut down in time");
    }

    info!("shadowsync shutdown complete");
    Ok(())
}
