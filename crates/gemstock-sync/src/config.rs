//! # Engine Configuration
//!
//! ## Load Order (later overrides earlier)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Defaults          EngineConfig::default()                           │
//! │  2. Config file       <config dir>/gemstock/engine.toml                 │
//! │  3. Environment       GEMSTOCK_TODAY_TTL_SECS, GEMSTOCK_DB_PATH, …      │
//! │  4. validate()        reject nonsense before anything starts            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use gemstock_core::ttl::{business_offset, TtlPolicy};
use gemstock_core::{IN_FILTER_LIMIT, SCHEMA_VERSION};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Cache Settings
// =============================================================================

/// TTLs, sweep cadence and the persisted-key namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL of keys embedding today's date (seconds).
    #[serde(default = "default_today_ttl")]
    pub today_ttl_secs: u64,

    /// TTL of every other key (seconds). Also the sweep age.
    #[serde(default = "default_historical_ttl")]
    pub historical_ttl_secs: u64,

    /// Interval between eviction sweeps (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Schema version stamped on persisted entries.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Prefix of every key this cache writes to the persistent tier.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_today_ttl() -> u64 {
    300
}
fn default_historical_ttl() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    1800
}
fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}
fn default_key_prefix() -> String {
    "gemstock.cache.".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            today_ttl_secs: default_today_ttl(),
            historical_ttl_secs: default_historical_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            schema_version: default_schema_version(),
            key_prefix: default_key_prefix(),
        }
    }
}

// =============================================================================
// Writer / Reconciler / Replay / Storage Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterSettings {
    /// Debounce window of the persistence writer (milliseconds).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for WriterSettings {
    fn default() -> Self {
        WriterSettings {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    /// Wait before the one-shot refetch after a subscription error (seconds).
    #[serde(default = "default_refetch_backoff")]
    pub refetch_backoff_secs: u64,

    /// Collection holding the aggregate category documents.
    #[serde(default = "default_category_collection")]
    pub category_collection: String,
}

fn default_refetch_backoff() -> u64 {
    5
}
fn default_category_collection() -> String {
    "stockCategories".to_string()
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        ReconcilerSettings {
            refetch_backoff_secs: default_refetch_backoff(),
            category_collection: default_category_collection(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Largest IN filter the store accepts.
    #[serde(default = "default_in_filter_limit")]
    pub in_filter_limit: usize,

    /// Business-day offset from UTC (minutes), used for end-of-day cutoffs
    /// and for deciding which keys are "today".
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
}

fn default_in_filter_limit() -> usize {
    IN_FILTER_LIMIT
}
fn default_utc_offset() -> i32 {
    gemstock_core::ttl::DEFAULT_UTC_OFFSET_MINUTES
}

impl Default for ReplaySettings {
    fn default() -> Self {
        ReplaySettings {
            in_filter_limit: default_in_filter_limit(),
            utc_offset_minutes: default_utc_offset(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file. `None` uses `<data dir>/gemstock.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Byte quota of the persistent cache tier.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            quota_bytes: default_quota_bytes(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
///
/// ## Example Config File
/// ```toml
/// [cache]
/// today_ttl_secs = 300
/// historical_ttl_secs = 3600
/// sweep_interval_secs = 1800
///
/// [writer]
/// debounce_ms = 1000
///
/// [reconciler]
/// refetch_backoff_secs = 5
/// category_collection = "stockCategories"
///
/// [replay]
/// in_filter_limit = 10
/// utc_offset_minutes = 420
///
/// [storage]
/// database_path = "/var/lib/gemstock/gemstock.db"
/// quota_bytes = 5242880
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub writer: WriterSettings,

    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    #[serde(default)]
    pub replay: ReplaySettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let cache = &self.cache;
        if cache.today_ttl_secs == 0 || cache.historical_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "cache TTLs must be greater than 0".into(),
            ));
        }
        if cache.today_ttl_secs > cache.historical_ttl_secs {
            return Err(SyncError::InvalidConfig(format!(
                "today_ttl_secs ({}) must not exceed historical_ttl_secs ({})",
                cache.today_ttl_secs, cache.historical_ttl_secs
            )));
        }
        if cache.sweep_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        if cache.key_prefix.is_empty() {
            return Err(SyncError::InvalidConfig("key_prefix must not be empty".into()));
        }

        if self.writer.debounce_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "debounce_ms must be greater than 0".into(),
            ));
        }

        let limit = self.replay.in_filter_limit;
        if limit == 0 || limit > IN_FILTER_LIMIT {
            return Err(SyncError::InvalidConfig(format!(
                "in_filter_limit must be between 1 and {}, got {}",
                IN_FILTER_LIMIT, limit
            )));
        }

        business_offset(self.replay.utc_offset_minutes)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse::<u64>("GEMSTOCK_TODAY_TTL_SECS") {
            self.cache.today_ttl_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("GEMSTOCK_HISTORICAL_TTL_SECS") {
            self.cache.historical_ttl_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("GEMSTOCK_SWEEP_INTERVAL_SECS") {
            self.cache.sweep_interval_secs = secs;
        }
        if let Some(ms) = env_parse::<u64>("GEMSTOCK_DEBOUNCE_MS") {
            self.writer.debounce_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("GEMSTOCK_REFETCH_BACKOFF_SECS") {
            self.reconciler.refetch_backoff_secs = secs;
        }
        if let Some(minutes) = env_parse::<i32>("GEMSTOCK_UTC_OFFSET_MINUTES") {
            debug!(minutes, "Overriding business UTC offset from environment");
            self.replay.utc_offset_minutes = minutes;
        }
        if let Ok(path) = std::env::var("GEMSTOCK_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(bytes) = env_parse::<u64>("GEMSTOCK_QUOTA_BYTES") {
            self.storage.quota_bytes = bytes;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "gemstock", "gemstock")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Database path, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "gemstock", "gemstock")
                .map(|dirs| dirs.data_dir().join("gemstock.db"))
                .unwrap_or_else(|| PathBuf::from("gemstock.db"))
        })
    }

    /// TTL policy described by the `[cache]` and `[replay]` sections.
    pub fn ttl_policy(&self) -> SyncResult<TtlPolicy> {
        TtlPolicy::from_secs(
            self.cache.today_ttl_secs,
            self.cache.historical_ttl_secs,
            self.replay.utc_offset_minutes,
        )
        .map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.writer.debounce_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }

    pub fn refetch_backoff(&self) -> Duration {
        Duration::from_secs(self.reconciler.refetch_backoff_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.today_ttl_secs, 300);
        assert_eq!(config.cache.historical_ttl_secs, 3600);
        assert_eq!(config.cache.sweep_interval_secs, 1800);
        assert_eq!(config.writer.debounce_ms, 1000);
        assert_eq!(config.reconciler.refetch_backoff_secs, 5);
        assert_eq!(config.replay.in_filter_limit, 10);
        assert_eq!(config.replay.utc_offset_minutes, 420);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.cache.today_ttl_secs = 7200;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.writer.debounce_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.replay.in_filter_limit = 11;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.replay.utc_offset_minutes = 24 * 60;
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [cache]
            today_ttl_secs = 60

            [replay]
            utc_offset_minutes = 480
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.today_ttl_secs, 60);
        assert_eq!(config.cache.historical_ttl_secs, 3600);
        assert_eq!(config.replay.utc_offset_minutes, 480);
        assert_eq!(config.reconciler.category_collection, "stockCategories");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.cache.key_prefix = "test.".to_string();
        config.save(Some(path.clone())).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.cache.key_prefix, "test.");
    }
}
