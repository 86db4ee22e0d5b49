//! # Cache Repository
//!
//! Key/value storage behind the persistent cache tier. Values are opaque
//! JSON strings; the engine owns their shape.
//!
//! When a byte quota is configured, `put` refuses writes that would push the
//! stored total past it (the replaced value of the same key does not count)
//! with [`DbError::QuotaExceeded`]. Freeing space is the caller's job.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Repository for persisted cache entries.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
    quota_bytes: Option<u64>,
}

impl CacheRepository {
    pub fn new(pool: SqlitePool, quota_bytes: Option<u64>) -> Self {
        CacheRepository { pool, quota_bytes }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM cache_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Writes `value` under `key`, enforcing the quota.
    pub async fn put(&self, key: &str, value: &str) -> DbResult<()> {
        let needed = value.len() as u64;
        let mut tx = self.pool.begin().await?;

        if let Some(quota) = self.quota_bytes {
            let used: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE key != ?1",
            )
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

            let available = quota.saturating_sub(used.max(0) as u64);
            if needed > available {
                return Err(DbError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, written_at, size_bytes)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                written_at = excluded.written_at,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .bind(needed as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(key = %key, bytes = needed, "Persisted cache entry");
        Ok(())
    }

    /// Removes `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn keys(&self) -> DbResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM cache_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }
}
