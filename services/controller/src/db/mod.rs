//! Postgres backends for the entity store and the task queue.
//!
//! Both share one pool. SQL is built at runtime; nothing here needs a
//! database at compile time.

mod entities;
mod error;
mod queue;

pub use entities::PgEntityStore;
pub use error::DbError;
pub use queue::PgTaskQueue;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a task or request waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/vmfleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    /// Unparseable counts fall back to the defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let count = |key: &str, default: u32| {
            var(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            max_connections: count("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: count("DB_MIN_CONNECTIONS", defaults.min_connections),
            database_url: var("DATABASE_URL").unwrap_or_else(|| defaults.database_url.clone()),
            ..defaults
        }
    }
}

/// Where `run_migrations` looks, relative to the working directory first.
const MIGRATION_DIRS: [&str; 2] = ["migrations", "services/controller/migrations"];

/// Shared connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
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
            "Connected to controller database"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the controller schema. Dev mode only; deployments migrate out
    /// of band.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = migration_candidates();
        let Some(dir) = candidates.iter().find(|dir| dir.is_dir()) else {
            return Err(DbError::MigrationDirNotFound {
                tried: candidates
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };

        let migrator = Migrator::new(dir.as_path())
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(dir = %dir.display(), "Controller schema up to date");
        Ok(())
    }

    pub fn entity_store(&self) -> PgEntityStore {
        PgEntityStore::new(self.pool.clone())
    }

    pub fn task_queue(&self) -> PgTaskQueue {
        PgTaskQueue::new(self.pool.clone())
    }
}

fn migration_candidates() -> Vec<PathBuf> {
    MIGRATION_DIRS
        .iter()
        .map(PathBuf::from)
        .chain(std::iter::once(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ))
        .collect()
}
