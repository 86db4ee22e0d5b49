//! # gemstock-core: Pure Stock Logic for Gemstock
//!
//! This crate holds the parts of the stock cache that are plain computation:
//! replaying the append-only ledger, classifying cache keys for TTL, and the
//! last-write-wins merge used by both the change feed and sibling tabs.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Gemstock Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Browser UI (tables, modals, export)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ compute_quantity / get_cached / render │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        gemstock-sync (engine, cache, reconciler, writer)        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ gemstock-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐   │   │
//! │  │   │  types   │  │  replay  │  │   ttl    │  │    merge     │   │   │
//! │  │   │ Ledger   │  │  fold    │  │ today vs │  │ LWW per      │   │   │
//! │  │   │ Snapshot │  │ cutoff   │  │ history  │  │ item type    │   │   │
//! │  │   └──────────┘  └──────────┘  └──────────┘  └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Ledger entries, movement kinds, snapshots, cache payloads
//! - [`replay`] - Folding ledger entries into quantities
//! - [`ttl`] - Today/historical TTL policy
//! - [`key`] - Cache key construction and date tokens
//! - [`merge`] - Last-write-wins merge of aggregate category documents
//! - [`ring`] - Bounded history ring buffer
//! - [`ingest`] - Provenance adapter for raw store documents
//! - [`clock`] - Injectable time source
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use gemstock_core::replay::replay;
//! use gemstock_core::{ItemSelection, LedgerEntry, MovementKind};
//!
//! let t = |h| Utc.with_ymd_and_hms(2026, 10, 16, h, 0, 0).unwrap();
//! let entries = vec![
//!     LedgerEntry::new("X70", MovementKind::InitialStock, 5, t(1)),
//!     LedgerEntry::new("X70", MovementKind::StockAddition, 2, t(2)),
//!     LedgerEntry::new("X70", MovementKind::Sale, 1, t(3)),
//! ];
//!
//! let outcome = replay(&entries, t(23), &ItemSelection::codes(["X70"]));
//! assert_eq!(outcome.quantity_of("X70"), 6);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod ingest;
pub mod key;
pub mod merge;
pub mod replay;
pub mod ring;
pub mod ttl;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ValidationError};
pub use ring::HistoryRing;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Schema version written into every persisted cache entry.
///
/// Bump when the shape of [`CachePayload`] changes; persisted entries with a
/// different version are treated as misses and purged.
pub const SCHEMA_VERSION: u32 = 1;

/// Largest number of values the document store accepts in one "IN" filter.
///
/// Batch replays split their item codes into chunks of at most this size.
pub const IN_FILTER_LIMIT: usize = 10;

/// Number of recent movements kept on an aggregate item-type node.
pub const HISTORY_CAPACITY: usize = 10;

/// Maximum length of an item code.
pub const MAX_ITEM_CODE_LEN: usize = 50;
