//! # gemstock-sync: Stock Cache & Reconciliation Engine for Gemstock
//!
//! This crate keeps the jewelry stock pages fast and consistent: quantities
//! are replayed from the append-only ledger on demand, cached in two tiers,
//! and kept converged with the live aggregate documents and sibling tabs.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stock Engine Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   StockEngine (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  compute_quantity / compute_quantities / refresh / get_cached    │  │
//! │  │  record_movement / init / dispose                                │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Replay Engine  │  │ CacheManager   │  │ ChangeFeedReconciler   │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Chunked ledger │  │ Memory tier +  │  │ Live aggregate feed,   │    │
//! │  │ queries, one   │  │ persistent     │  │ LWW merge, stale flag, │    │
//! │  │ fold per batch │  │ tier, TTL,     │  │ backoff + refetch      │    │
//! │  │                │  │ hourly sweep   │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                              │                                          │
//! │               ┌──────────────┴──────────────┐                          │
//! │               ▼                             ▼                           │
//! │  ┌────────────────────────┐   ┌────────────────────────────────┐       │
//! │  │ DebouncedWriter        │   │ CrossTabSynchronizer           │       │
//! │  │ dirty keys ─► tier     │   │ PubSubPort ─► LWW ─► render    │       │
//! │  │ quota ─► one eviction  │   │                                │       │
//! │  └────────────────────────┘   └────────────────────────────────┘       │
//! │                                                                         │
//! │  RENDER EVENTS (to the page via RenderSink):                           │
//! │  • render(key) - a cached key changed                                  │
//! │  • stale(bool) - data may be out of date while the store is away       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - Main `StockEngine` orchestrator
//! - [`replay`] - Chunked ledger replay
//! - [`cache`] - Two-tier cache with TTL and sweep
//! - [`writer`] - Debounced persistent-tier writer
//! - [`reconciler`] - Change-feed reconciliation
//! - [`crosstab`] - Sibling-tab synchronization
//! - [`store`] - Ledger and document store ports plus memory/SQLite backends
//! - [`persist`] - Persistent tier port plus memory/SQLite backends
//! - [`render`] - Render sink port
//! - [`config`] - Engine configuration (TTLs, debounce, paths)
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gemstock_core::SystemClock;
//! use gemstock_db::{Database, DbConfig};
//! use gemstock_sync::{
//!     CacheManager, CacheOptions, EngineConfig, EngineOptions, NoOpRender, SqliteStore,
//!     SqliteTier, StockEngine,
//! };
//!
//! let config = EngineConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let cache = CacheManager::new(
//!     SqliteTier::new(db.cache_entries()),
//!     CacheOptions::from_config(&config)?,
//!     Arc::new(SystemClock),
//! );
//! let engine = StockEngine::new(
//!     SqliteStore::new(db),
//!     cache,
//!     EngineOptions::from_config(&config)?,
//!     Arc::new(NoOpRender),
//! );
//! engine.init();
//!
//! let quantity = engine.compute_quantity("X70", engine.today()).await?;
//! println!("X70: {}", quantity);
//!
//! engine.dispose().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod crosstab;
pub mod engine;
pub mod error;
pub mod persist;
pub mod reconciler;
pub mod render;
pub mod replay;
pub mod store;
pub mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{CacheManager, CacheOptions, CacheStats, FlushReport, MergeOrigin};
pub use config::{
    CacheSettings, EngineConfig, ReconcilerSettings, ReplaySettings, StorageSettings,
    WriterSettings,
};
pub use crosstab::{
    BusEndpoint, CrossTabHandle, CrossTabSynchronizer, LocalBus, PubSubPort, RemoteChange,
};
pub use engine::{AggregateTarget, EngineOptions, StockEngine};
pub use error::{SyncError, SyncResult};
pub use persist::{MemoryTier, PersistError, PersistResult, PersistentTier, SqliteTier};
pub use reconciler::{ChangeFeedReconciler, ReconcilerHandle, ReconcilerOptions};
pub use render::{ChannelRender, NoOpRender, RenderEvent, RenderSink};
pub use replay::StockReplayEngine;
pub use store::{
    ChangeBatch, ChangeFeed, ChangeKind, DocumentChange, DocumentStore, FeedEvent, LedgerQuery,
    LedgerStore, MemoryStore, SqliteStore,
};
pub use writer::WriterHandle;

// =============================================================================
// Tracing
// =============================================================================

/// Installs the global `fmt` subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=gemstock_sync=trace` - Show trace for the engine only
/// - Default: INFO, with DEBUG for the gemstock crates
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gemstock=debug,sqlx=warn"));

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
