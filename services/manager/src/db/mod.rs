//! Postgres backing for the event log.
//!
//! [`Database`] owns the pool and the schema; [`PgEventStore`] is the
//! [`EventStore`](crate::store::EventStore) built on top of it.

mod error;
mod event_store;

pub use error::DbError;
pub use event_store::PgEventStore;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// Pool settings, read from `DATABASE_URL` and `DB_*` by
/// [`Config`](crate::config::Config).
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Directory holding the event log schema. When unset, the usual
    /// locations relative to the working directory and the crate are tried.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/shadowsync".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            migrations_dir: None,
        }
    }
}

impl DbConfig {
    /// Schema directories to try, most specific first.
    fn migration_dirs(&self) -> Vec<PathBuf> {
        match &self.migrations_dir {
            Some(dir) => vec![dir.clone()],
            None => vec![
                PathBuf::from("migrations"),
                PathBuf::from("services/manager/migrations"),
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
            ],
        }
    }
}

/// Shared handle to the event log database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migration_dirs: Vec<PathBuf>,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Event log database pool ready"
        );
        Ok(Self {
            pool,
            migration_dirs: config.migration_dirs(),
        })
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(DbError::Query)
    }

    /// Brings the `events` schema up to date.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let mut failures = Vec::new();
        for dir in &self.migration_dirs {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(err) => {
                    debug!(dir = %dir.display(), error = %err, "No event log schema here");
                    failures.push(format!("{}: {err}", dir.display()));
                    continue;
                }
            };
            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            info!(dir = %dir.display(), "Event log schema up to date");
            return Ok(());
        }
        Err(DbError::MigrationDirNotFound {
            tried: failures.join("; "),
        })
    }

    /// Event store over this pool. Events stay visible for `retention`.
    pub fn event_store(&self, retention: chrono::Duration) -> PgEventStore {
        PgEventStore::new(self.pool.clone(), retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.ends_with("/shadowsync"));
        assert!(config.migrations_dir.is_none());
    }

    #[test]
    fn test_migration_dirs() {
        let defaults = DbConfig::default().migration_dirs();
        assert_eq!(defaults.len(), 3);
        assert_eq!(defaults[0], PathBuf::from("migrations"));
        assert!(defaults[2].ends_with("migrations"));

        let pinned = DbConfig {
            migrations_dir: Some(PathBuf::from("/opt/shadowsync/schema")),
            ..Default::default()
        };
        assert_eq!(
            pinned.migration_dirs(),
            vec![PathBuf::from("/opt/shadowsync/schema")]
        );
    }

    #[tokio::test]
    async fn test_missing_schema_dir_is_reported() {
        let config = DbConfig {
            database_url: "postgres://shadowsync@127.0.0.1:1/shadowsync".to_string(),
            migrations_dir: Some(PathBuf::from("/nonexistent/shadowsync-schema")),
            ..Default::default()
        };
        let db = Database {
            pool: PgPoolOptions::new().connect_lazy(&config.database_url).unwrap(),
            migration_dirs: config.migration_dirs(),
        };
        match db.run_migrations().await {
            Err(DbError::MigrationDirNotFound { tried }) => {
                assert!(tried.contains("/nonexistent/shadowsync-schema"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
