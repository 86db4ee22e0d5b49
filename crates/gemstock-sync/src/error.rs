//! # Engine Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Category        Examples                        Handling               │
//! │  ──────────────  ──────────────────────────────  ────────────────────── │
//! │  Transient       StoreUnavailable, Subscription  stale cache + backoff  │
//! │  Quota           Persist(QuotaExceeded)          evict, never surfaced  │
//! │  Config          InvalidConfig, ConfigLoad       fail startup           │
//! │  Hard failure    Unavailable                     page shows a blocker   │
//! │  Internal        ChannelError, ShuttingDown      log                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Negative stock and unknown movement kinds are not errors; they are logged
//! by the replay engine and the computed value is returned as-is.

use gemstock_core::{CoreError, ValidationError};
use gemstock_db::DbError;
use thiserror::Error;

use crate::persist::PersistError;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Store Errors
    // =========================================================================
    /// The document store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The live subscription failed or was dropped by the store.
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// A query asked for more values than the store's IN filter allows.
    #[error("IN filter of {requested} values exceeds the limit of {limit}")]
    QueryLimitExceeded { requested: usize, limit: usize },

    /// Database error that is not a connectivity problem.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Rejected input.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Domain error from gemstock-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Persistent tier failure.
    #[error("Persistent tier: {0}")]
    Persist(#[from] PersistError),

    /// Nothing cached and the store is unreachable.
    #[error("No data available for {key}: {reason}")]
    Unavailable { key: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A background task is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(v) => SyncError::Validation(v),
            DbError::QuotaExceeded { key, .. } => {
                SyncError::Persist(PersistError::QuotaExceeded { key })
            }
            other if other.is_unavailable() => SyncError::StoreUnavailable(other.to_string()),
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl SyncError {
    /// Transient remote failures worth a backoff and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::SubscriptionFailed(_)
        )
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SyncError::Persist(PersistError::QuotaExceeded { .. }))
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
