//! # Domain Types
//!
//! Core domain types shared by the replay engine, the cache tier and the
//! change-feed reconciler.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   fold    ┌─────────────────┐                      │
//! │  │  LedgerEntry    │ ────────► │ StockSnapshot   │                      │
//! │  │  (immutable)    │  replay   │  (derived)      │                      │
//! │  │  item_code      │           │  item_code      │                      │
//! │  │  movement_kind  │           │  quantity       │                      │
//! │  │  quantity ≥ 0   │           │  as_of          │                      │
//! │  │  occurred_at    │           └────────┬────────┘                      │
//! │  └─────────────────┘                    │                               │
//! │                                         ▼                               │
//! │  ┌─────────────────┐           ┌─────────────────┐                      │
//! │  │ CategoryDocument│ ────────► │   CacheEntry    │ ◄── PersistedEntry   │
//! │  │ itemType → Node │   merge   │  key, payload,  │     (JSON on disk)   │
//! │  │ (quantity,      │   (LWW)   │  source,        │                      │
//! │  │  lastUpdated,   │           │  version,       │                      │
//! │  │  history[≤10],  │           │  written_at     │                      │
//! │  │  details)       │           └─────────────────┘                      │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ring::HistoryRing;
use crate::HISTORY_CAPACITY;

// =============================================================================
// Movement Kind
// =============================================================================

/// How a movement changes the running quantity during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementEffect {
    /// `quantity += entry.quantity`
    Increase,
    /// `quantity -= entry.quantity`
    Decrease,
    /// `quantity := entry.quantity` (absolute set, not a delta)
    Set,
    /// Unrecognized kind; skipped and reported as an anomaly.
    Ignore,
}

/// The kind of a stock movement as recorded in the ledger.
///
/// Ledger documents carry free-form kind strings; several aliases map onto
/// the same kind. Anything unknown is kept verbatim in
/// [`MovementKind::Unrecognized`] so it can be reported, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MovementKind {
    /// Opening stock for a new item code.
    InitialStock,
    /// Manual stock addition from the add-stock form.
    StockAddition,
    /// Miscellaneous "add" movements (`add`, `addition`, `tambah`, `restock`).
    Add,
    /// Item sold (`laku`).
    Sale,
    /// Item handed out as a free gift.
    FreeGift,
    /// Item consumed by a lock change.
    LockChange,
    /// Item returned to the supplier.
    Return,
    /// Absolute stock count correction.
    Adjustment,
    /// Kind string the engine does not know.
    Unrecognized(String),
}

impl MovementKind {
    /// Parses a kind string, accepting the known aliases.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "initialStock" | "initial_stock" | "stokAwal" => MovementKind::InitialStock,
            "stockAddition" | "stock_addition" => MovementKind::StockAddition,
            "add" | "addition" | "tambah" | "restock" => MovementKind::Add,
            "laku" | "sale" => MovementKind::Sale,
            "free" | "freeGift" | "free_gift" => MovementKind::FreeGift,
            "gantiLock" | "lockChange" | "lock_change" => MovementKind::LockChange,
            "return" | "retur" => MovementKind::Return,
            "adjustment" => MovementKind::Adjustment,
            other => MovementKind::Unrecognized(other.to_string()),
        }
    }

    /// Canonical string written back to the store.
    pub fn as_str(&self) -> &str {
        match self {
            MovementKind::InitialStock => "initialStock",
            MovementKind::StockAddition => "stockAddition",
            MovementKind::Add => "add",
            MovementKind::Sale => "laku",
            MovementKind::FreeGift => "free",
            MovementKind::LockChange => "gantiLock",
            MovementKind::Return => "return",
            MovementKind::Adjustment => "adjustment",
            MovementKind::Unrecognized(raw) => raw,
        }
    }

    /// Replay semantics of this kind.
    pub fn effect(&self) -> MovementEffect {
        match self {
            MovementKind::InitialStock | MovementKind::StockAddition | MovementKind::Add => {
                MovementEffect::Increase
            }
            MovementKind::Sale
            | MovementKind::FreeGift
            | MovementKind::LockChange
            | MovementKind::Return => MovementEffect::Decrease,
            MovementKind::Adjustment => MovementEffect::Set,
            MovementKind::Unrecognized(_) => MovementEffect::Ignore,
        }
    }

    /// Applies this kind to a running total. Returns `None` for kinds that
    /// leave the total untouched.
    pub fn apply(&self, running: i64, quantity: i64) -> Option<i64> {
        match self.effect() {
            MovementEffect::Increase => Some(running + quantity),
            MovementEffect::Decrease => Some(running - quantity),
            MovementEffect::Set => Some(quantity),
            MovementEffect::Ignore => None,
        }
    }
}

impl From<String> for MovementKind {
    fn from(raw: String) -> Self {
        MovementKind::parse(&raw)
    }
}

impl From<MovementKind> for String {
    fn from(kind: MovementKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Ledger Entry
// =============================================================================

/// One immutable stock movement.
///
/// Created once per sale, addition, return or correction; never mutated.
/// Only bulk retention cleanup ever deletes entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LedgerEntry {
    /// Document id assigned by the store.
    #[serde(default)]
    pub id: String,

    /// Item code the movement applies to (e.g. "X70").
    pub item_code: String,

    /// Movement kind.
    #[ts(as = "String")]
    pub movement_kind: MovementKind,

    /// Moved quantity, never negative.
    pub quantity: i64,

    /// Server-assigned timestamp.
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl LedgerEntry {
    /// Creates an entry without an id, note or actor.
    pub fn new(
        item_code: impl Into<String>,
        movement_kind: MovementKind,
        quantity: i64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        LedgerEntry {
            id: String::new(),
            item_code: item_code.into(),
            movement_kind,
            quantity,
            occurred_at,
            note: None,
            actor: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// A movement about to be appended. The store assigns the id and, when
/// `occurred_at` is left unset, the server timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLedgerEntry {
    pub item_code: String,
    pub movement_kind: MovementKind,
    pub quantity: i64,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

impl NewLedgerEntry {
    pub fn new(item_code: impl Into<String>, movement_kind: MovementKind, quantity: i64) -> Self {
        NewLedgerEntry {
            item_code: item_code.into(),
            movement_kind,
            quantity,
            occurred_at: None,
            note: None,
            actor: None,
        }
    }

    /// Pins the timestamp instead of letting the store assign one.
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Finalizes the entry with the store-assigned id and server time.
    pub fn into_entry(self, id: impl Into<String>, server_now: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: id.into(),
            item_code: self.item_code,
            movement_kind: self.movement_kind,
            quantity: self.quantity,
            occurred_at: self.occurred_at.unwrap_or(server_now),
            note: self.note,
            actor: self.actor,
        }
    }
}

// =============================================================================
// Stock Snapshot
// =============================================================================

/// Quantity derived by replaying the ledger up to `as_of`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StockSnapshot {
    pub item_code: String,
    pub quantity: i64,
    /// Replay cutoff (inclusive).
    #[ts(as = "String")]
    pub as_of: DateTime<Utc>,
}

/// Which item codes a batch replay covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSelection {
    /// Every item code present in the ledger.
    All,
    /// Only these codes; codes without entries report 0.
    Codes(Vec<String>),
}

impl ItemSelection {
    pub fn codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ItemSelection::Codes(codes.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, item_code: &str) -> bool {
        match self {
            ItemSelection::All => true,
            ItemSelection::Codes(codes) => codes.iter().any(|c| c == item_code),
        }
    }
}

// =============================================================================
// Aggregate Category Documents
// =============================================================================

/// One entry of an item-type node's recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct HistoryItem {
    #[ts(as = "String")]
    pub kind: MovementKind,
    pub quantity: i64,
    #[ts(as = "String")]
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl HistoryItem {
    pub fn new(kind: MovementKind, quantity: i64, at: DateTime<Utc>) -> Self {
        HistoryItem {
            kind,
            quantity,
            at,
            subtype: None,
            note: None,
            actor: None,
        }
    }
}

/// Aggregate state of one item type inside a category document.
///
/// This node is the unit of last-write-wins comparison, keyed by
/// `(category, itemType)` and ordered by `last_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ItemTypeNode {
    pub quantity: i64,

    #[ts(as = "String")]
    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    #[ts(as = "Vec<HistoryItem>")]
    pub history: HistoryRing<HistoryItem>,

    /// Quantity per subtype (e.g. size or karat).
    #[serde(default)]
    pub details: BTreeMap<String, i64>,
}

impl ItemTypeNode {
    /// Creates an empty node last touched at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        ItemTypeNode {
            quantity: 0,
            last_updated: at,
            history: HistoryRing::with_capacity(HISTORY_CAPACITY),
            details: BTreeMap::new(),
        }
    }

    /// Applies a movement to the aggregate: adjusts the quantity (and the
    /// subtype detail when one is given), bumps `last_updated`, and pushes the
    /// movement onto the bounded history.
    ///
    /// Returns `false` and leaves the node untouched for unrecognized kinds.
    pub fn record_movement(&mut self, item: HistoryItem) -> bool {
        let Some(quantity) = item.kind.apply(self.quantity, item.quantity) else {
            return false;
        };
        self.quantity = quantity;

        if let Some(subtype) = item.subtype.as_deref() {
            let current = self.details.get(subtype).copied().unwrap_or(0);
            if let Some(next) = item.kind.apply(current, item.quantity) {
                self.details.insert(subtype.to_string(), next);
            }
        }

        if item.at > self.last_updated {
            self.last_updated = item.at;
        }
        self.history.push(item);
        true
    }
}

/// A category document: item-type key → node.
pub type CategoryDocument = BTreeMap<String, ItemTypeNode>;

/// All cached category documents: category id → document.
pub type CategoryMap = BTreeMap<String, CategoryDocument>;

// =============================================================================
// Provenance & Cache Entries
// =============================================================================

/// Which upstream source produced a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum Provenance {
    /// Computed by replaying the transaction ledger.
    LedgerDerived,
    /// Read from the per-category aggregate documents.
    AggregateDerived,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::LedgerDerived => write!(f, "ledgerDerived"),
            Provenance::AggregateDerived => write!(f, "aggregateDerived"),
        }
    }
}

/// The cached value behind one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum CachePayload {
    /// Replayed snapshots keyed by item code.
    Stock(BTreeMap<String, StockSnapshot>),
    /// Merged category documents.
    Categories(CategoryMap),
    /// Any other list the page caches as-is.
    List(Vec<serde_json::Value>),
}

impl CachePayload {
    pub fn as_stock(&self) -> Option<&BTreeMap<String, StockSnapshot>> {
        match self {
            CachePayload::Stock(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_categories(&self) -> Option<&CategoryMap> {
        match self {
            CachePayload::Categories(map) => Some(map),
            _ => None,
        }
    }
}

/// An in-process cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: CachePayload,
    pub source: Provenance,
    pub version: u32,
    pub written_at: DateTime<Utc>,
}

/// On-disk layout of one cache entry: `{ timestamp, version, data, source }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub version: u32,
    pub data: CachePayload,
    pub source: Provenance,
}

impl PersistedEntry {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        PersistedEntry {
            timestamp: entry.written_at.timestamp_millis(),
            version: entry.version,
            data: entry.payload.clone(),
            source: entry.source,
        }
    }

    /// Written-at time, if the stored timestamp is representable.
    pub fn written_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Rebuilds the in-process entry for `key`.
    pub fn into_entry(self, key: impl Into<String>) -> Option<CacheEntry> {
        let written_at = self.written_at()?;
        Some(CacheEntry {
            key: key.into(),
            payload: self.data,
            source: self.source,
            version: self.version,
            written_at,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
