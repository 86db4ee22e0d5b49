//! # gemstock-db: Database Layer for Gemstock
//!
//! SQLite storage for the stock ledger, the per-category aggregate
//! documents, and the persistent mirror of the stock cache.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gemstock Data Flow                               │
//! │                                                                         │
//! │  gemstock-sync (SqliteStore, SqliteTier)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    gemstock-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │   │   │
//! │  │   │               │    │ LedgerRepo     │   │              │   │   │
//! │  │   │ SqlitePool    │◄───│ DocumentRepo   │   │ 001_initial  │   │   │
//! │  │   │               │    │ CacheRepo      │   │              │   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pool`] - Connection pool management
//! - [`migrations`] - Embedded schema migrations
//! - [`error`] - Database error types
//! - [`repository`] - Ledger, document and cache repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gemstock_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("gemstock.db")).await?;
//! let entry = db.ledger().append(NewLedgerEntry::new("X70", MovementKind::Sale, 1)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cache::CacheRepository;
pub use repository::documents::{DocumentRepository, StoredDocument};
pub use repository::ledger::LedgerRepository;
