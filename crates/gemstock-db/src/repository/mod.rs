//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.ledger()          LedgerRepository                                  │
//! │  ├── append(entry)              validate, assign id + server time       │
//! │  ├── list_until(cutoff, codes)  ordered scan, optional IN filter        │
//! │  └── delete_older_than(cutoff)  retention cleanup                       │
//! │                                                                         │
//! │  db.documents()       DocumentRepository                                │
//! │  ├── get / list                                                         │
//! │  ├── merge_update(collection, id, patch)  top-level field merge         │
//! │  └── replace / delete                                                   │
//! │                                                                         │
//! │  db.cache_entries()   CacheRepository                                   │
//! │  └── get / put (quota-checked) / delete / keys                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod documents;
pub mod ledger;

use chrono::{DateTime, Utc};

use crate::error::{DbError, DbResult};

/// Reads a stored millisecond timestamp back into a `DateTime`.
pub(crate) fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Internal(format!("timestamp out of range: {}", ms)))
}
