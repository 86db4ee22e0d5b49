//! # Persistent Cache Tier
//!
//! The durable half of the cache: a string key/value store with a byte
//! quota. [`SqliteTier`] backs it with the `cache_entries` table;
//! [`MemoryTier`] keeps everything in a map and can be told to fail.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use gemstock_db::{CacheRepository, DbError};
use thiserror::Error;

/// Failures of the persistent tier.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistError {
    /// The write would exceed the tier's byte quota.
    #[error("Quota exceeded writing {key}")]
    QuotaExceeded { key: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Backend failure other than quota.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<DbError> for PersistError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::QuotaExceeded { key, .. } => PersistError::QuotaExceeded { key },
            DbError::Serialization(reason) => PersistError::Serialization(reason),
            other => PersistError::Backend(other.to_string()),
        }
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// A quota-bounded string key/value store that survives restarts.
pub trait PersistentTier: Send + Sync + 'static {
    fn read(&self, key: &str) -> impl Future<Output = PersistResult<Option<String>>> + Send;

    fn write(&self, key: &str, value: &str) -> impl Future<Output = PersistResult<()>> + Send;

    /// Removes `key`; removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = PersistResult<()>> + Send;

    fn keys(&self) -> impl Future<Output = PersistResult<Vec<String>>> + Send;
}

// =============================================================================
// SQLite Tier
// =============================================================================

/// Persistent tier stored in the `cache_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteTier {
    repo: CacheRepository,
}

impl SqliteTier {
    pub fn new(repo: CacheRepository) -> Self {
        SqliteTier { repo }
    }
}

impl PersistentTier for SqliteTier {
    async fn read(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.repo.get(key).await?)
    }

    async fn write(&self, key: &str, value: &str) -> PersistResult<()> {
        Ok(self.repo.put(key, value).await?)
    }

    async fn remove(&self, key: &str) -> PersistResult<()> {
        self.repo.delete(key).await?;
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        Ok(self.repo.keys().await?)
    }
}

// =============================================================================
// In-Memory Tier
// =============================================================================

#[derive(Debug, Default)]
struct MemoryTierState {
    values: BTreeMap<String, String>,
    failing: HashSet<String>,
    quota_bytes: Option<u64>,
    writes: usize,
}

/// In-memory tier. Clones share state.
///
/// Keys registered with [`MemoryTier::fail_key`] always fail to write with
/// [`PersistError::Backend`]; a configured quota makes oversized writes fail
/// with [`PersistError::QuotaExceeded`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTier {
    state: Arc<Mutex<MemoryTierState>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        let tier = Self::default();
        tier.lock().quota_bytes = Some(quota_bytes);
        tier
    }

    /// Makes every future write of `key` fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.lock().failing.insert(key.into());
    }

    /// Stores `value` directly, bypassing quota and failure injection.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().values.insert(key.into(), value.into());
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().values.values().map(|v| v.len() as u64).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PersistentTier for MemoryTier {
    async fn read(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.get_raw(key))
    }

    async fn write(&self, key: &str, value: &str) -> PersistResult<()> {
        let mut state = self.lock();
        if state.failing.contains(key) {
            return Err(PersistError::Backend(format!("injected failure for {}", key)));
        }

        if let Some(quota) = state.quota_bytes {
            let others: u64 = state
                .values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if others + value.len() as u64 > quota {
                return Err(PersistError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        state.values.insert(key.to_string(), value.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn remove(&self, key: &str) -> PersistResult<()> {
        self.lock().values.remove(key);
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        Ok(self.lock().values.keys().cloned().collect())
    }
}
