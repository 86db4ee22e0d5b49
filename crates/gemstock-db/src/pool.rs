//! # Database Handle
//!
//! One SQLite file holds the ledger, the category documents and the
//! persistent cache tier. [`Database`] owns the pool and hands out a
//! repository per table.
//!
//! ```text
//! DbConfig::new(path).cache_quota_bytes(n)
//!        │
//!        ▼
//! Database::new(config) ── WAL, busy timeout, pool, migrations
//!        │
//!        ├── ledger()         append, range scan, retention
//!        ├── documents()      category documents, merge-update
//!        └── cache_entries()  persistent cache tier (quota-checked)
//! ```
//!
//! WAL lets the chunked ledger scans of a batch replay read while the
//! debounced cache writer commits.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cache::CacheRepository;
use crate::repository::documents::DocumentRepository;
use crate::repository::ledger::LedgerRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Where the database lives and how the pool and cache tier are sized.
///
/// ```rust,ignore
/// let config = DbConfig::new(engine_config.database_path())
///     .cache_quota_bytes(engine_config.storage.quota_bytes);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,
    /// Replay chunks run concurrently, one connection each. Default: 5
    pub max_connections: u32,
    /// How long a statement waits on a locked database. Default: 5 seconds
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Byte quota of the persistent cache tier. `None` means unlimited.
    pub cache_quota_bytes: Option<u64>,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
            cache_quota_bytes: None,
        }
    }

    /// A private in-memory database. A single connection, since every
    /// `:memory:` connection would otherwise see its own empty database.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            ..DbConfig::new(":memory:")
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Caps the persistent cache tier at `bytes`.
    pub fn cache_quota_bytes(mut self, bytes: u64) -> Self {
        self.cache_quota_bytes = Some(bytes);
        self
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the Gemstock database. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    cache_quota_bytes: Option<u64>,
}

impl Database {
    /// Opens (creating if needed) the database file and applies pending
    /// migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let path = config.database_path.display().to_string();
        info!(path = %path, "Opening database");

        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        debug!(
            max_connections = config.max_connections,
            cache_quota_bytes = ?config.cache_quota_bytes,
            "Database pool ready"
        );

        let db = Database {
            pool,
            cache_quota_bytes: config.cache_quota_bytes,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Applies pending migrations. Safe to call again.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        debug!("Migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn ledger(&self) -> LedgerRepository {
        LedgerRepository::new(self.pool.clone())
    }

    pub fn documents(&self) -> DocumentRepository {
        DocumentRepository::new(self.pool.clone())
    }

    /// The persistent cache tier, bounded by the configured quota.
    pub fn cache_entries(&self) -> CacheRepository {
        CacheRepository::new(self.pool.clone(), self.cache_quota_bytes)
    }

    pub async fn close(&self) {
        info!("Closing database");
        self.pool.close().await;
    }

    /// Whether a trivial query still succeeds.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
        assert_eq!(db.ledger().count().await.unwrap(), 0);
        assert!(db.cache_entries().keys().await.unwrap().is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/gemstock.db")
            .max_connections(0)
            .cache_quota_bytes(1024);

        assert_eq!(config.max_connections, 1);
        assert_eq!(config.cache_quota_bytes, Some(1024));
        assert_eq!(DbConfig::in_memory().database_path, PathBuf::from(":memory:"));
    }

    #[tokio::test]
    async fn test_quota_reaches_cache_repository() {
        let db = Database::new(DbConfig::in_memory().cache_quota_bytes(4)).await.unwrap();
        assert!(db.cache_entries().put("k", "12345").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_pool_fails_health_check() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
    }
}
