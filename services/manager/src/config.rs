use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use shadowsync_reconcile::BackoffPolicy;

use crate::db::DbConfig;
use crate::dispatcher::DispatchConfig;
use crate::store::default_retention;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,

    /// How long events stay visible. Zero or negative hides events as soon
    /// as they are written.
    pub event_retention: chrono::Duration,

    pub dispatch: DispatchConfig,
    pub dispatch_interval: Duration,
    pub expiry_sweep_interval: Duration,

    /// Sink for tenants without their own webhook integration.
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,

    /// JSON file listing tenant integrations.
    pub integrations_file: Option<PathBuf>,

    /// JSON file listing each tenant's devices for fleet sync.
    pub inventory_file: Option<PathBuf>,

    /// Base URL of the HTTP shadow bridge.
    pub shadow_bridge_url: Option<String>,
    pub shadow_bridge_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("SHADOWSYNC_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = lookup("SHADOWSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("SHADOWSYNC_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let db_defaults = DbConfig::default();
        let database = DbConfig {
            database_url: lookup("DATABASE_URL").unwrap_or(db_defaults.database_url),
            max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS")?
                .unwrap_or(db_defaults.max_connections),
            min_connections: parse_var(&lookup, "DB_MIN_CONNECTIONS")?
                .unwrap_or(db_defaults.min_connections),
            acquire_timeout: parse_var(&lookup, "DB_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(db_defaults.acquire_timeout),
            migrations_dir: lookup("SHADOWSYNC_MIGRATIONS_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            ..db_defaults
        };
        if database.min_connections > database.max_connections {
            return Err(anyhow!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                database.min_connections,
                database.max_connections
            ));
        }

        let event_retention = match parse_var::<i64>(&lookup, "SHADOWSYNC_EVENT_RETENTION_SECS")? {
            Some(secs) => chrono::Duration::try_seconds(secs).ok_or_else(|| {
                anyhow!("SHADOWSYNC_EVENT_RETENTION_SECS={secs} is out of range")
            })?,
            None => default_retention(),
        };

        let dispatch_defaults = DispatchConfig::default();
        let backoff = BackoffPolicy {
            base: parse_var(&lookup, "SHADOWSYNC_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(dispatch_defaults.backoff.base),
            max: parse_var(&lookup, "SHADOWSYNC_BACKOFF_MAX_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(dispatch_defaults.backoff.max),
            max_attempts: parse_var(&lookup, "SHADOWSYNC_DISPATCH_MAX_ATTEMPTS")?
                .unwrap_or(dispatch_defaults.backoff.max_attempts),
        };
        if backoff.max_attempts == 0 {
            return Err(anyhow!("SHADOWSYNC_DISPATCH_MAX_ATTEMPTS must be at least 1"));
        }

        let dispatch = DispatchConfig {
            batch_size: parse_nonzero(&lookup, "SHADOWSYNC_DISPATCH_BATCH_SIZE")?
                .unwrap_or(dispatch_defaults.batch_size),
            send_timeout: dispatch_defaults.send_timeout,
            backoff,
        };

        let dispatch_interval = parse_nonzero(&lookup, "SHADOWSYNC_DISPATCH_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let expiry_sweep_interval = parse_nonzero(&lookup, "SHADOWSYNC_EXPIRY_SWEEP_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        let webhook_url = lookup("SHADOWSYNC_WEBHOOK_URL").filter(|url| !url.is_empty());

        let webhook_timeout = parse_nonzero(&lookup, "SHADOWSYNC_WEBHOOK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let integrations_file = lookup("SHADOWSYNC_INTEGRATIONS_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let inventory_file = lookup("SHADOWSYNC_INVENTORY_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let shadow_bridge_url = lookup("SHADOWSYNC_SHADOW_BRIDGE_URL").filter(|url| !url.is_empty());
        let shadow_bridge_timeout = parse_nonzero(&lookup, "SHADOWSYNC_SHADOW_BRIDGE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            event_retention,
            dispatch: DispatchConfig {
                send_timeout: webhook_timeout,
                ..dispatch
            },
            dispatch_interval,
            expiry_sweep_interval,
            webhook_url,
            webhook_timeout,
            integrations_file,
            inventory_file,
            shadow_bridge_url,
            shadow_bridge_timeout,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        _ => Ok(None),
    }
}

/// Like [`parse_var`], but zero is rejected.
fn parse_nonzero(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match parse_var::<u64>(lookup, key)? {
        Some(0) => Err(anyhow!("{key} must be greater than zero")),
        value => Ok(value),
    }
}
