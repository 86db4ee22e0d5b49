//! # Ledger Replay
//!
//! Derives stock quantities by folding ledger entries in `occurred_at` order.
//!
//! ## Fold Rules
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  increase  (initialStock, stockAddition, add…)   q += entry.qty  │
//! │  decrease  (laku, free, gantiLock, return)       q -= entry.qty  │
//! │  adjustment                                      q  = entry.qty  │
//! │  anything else                                   q unchanged     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because adjustments are absolute, ordering is load-bearing. Entries are
//! stable-sorted by `occurred_at`, so entries sharing a timestamp keep the
//! order the store returned them in.
//!
//! Nothing here logs. Unknown kinds and negative results come back as
//! [`ReplayAnomaly`] values for the caller to report.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::types::{ItemSelection, LedgerEntry, StockSnapshot};

/// Something odd found while folding. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayAnomaly {
    /// Entry skipped because its movement kind is unknown.
    UnrecognizedKind {
        item_code: String,
        entry_id: String,
        kind: String,
    },
    /// Final quantity for an item came out below zero.
    NegativeQuantity { item_code: String, quantity: i64 },
}

/// Result of a replay: per-item quantities plus anything worth a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub quantities: BTreeMap<String, i64>,
    pub anomalies: Vec<ReplayAnomaly>,
}

impl ReplayOutcome {
    /// Quantity for `item_code`; 0 when the ledger has nothing for it.
    pub fn quantity_of(&self, item_code: &str) -> i64 {
        self.quantities.get(item_code).copied().unwrap_or(0)
    }

    /// Folds another outcome (e.g. from a different chunk) into this one.
    pub fn absorb(&mut self, other: ReplayOutcome) {
        self.quantities.extend(other.quantities);
        self.anomalies.extend(other.anomalies);
    }

    /// Materializes the quantities as snapshots taken at `as_of`.
    pub fn snapshots(&self, as_of: DateTime<Utc>) -> BTreeMap<String, StockSnapshot> {
        self.quantities
            .iter()
            .map(|(code, quantity)| {
                (
                    code.clone(),
                    StockSnapshot {
                        item_code: code.clone(),
                        quantity: *quantity,
                        as_of,
                    },
                )
            })
            .collect()
    }
}

/// Replays `entries` up to and including `cutoff` for the selected items.
///
/// Entries after the cutoff or outside the selection are skipped. Every code
/// named in an [`ItemSelection::Codes`] selection appears in the result, with
/// 0 if it has no entries.
pub fn replay(
    entries: &[LedgerEntry],
    cutoff: DateTime<Utc>,
    selection: &ItemSelection,
) -> ReplayOutcome {
    let mut ordered: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.occurred_at <= cutoff && selection.contains(&e.item_code))
        .collect();
    ordered.sort_by_key(|e| e.occurred_at);

    let mut outcome = ReplayOutcome::default();
    if let ItemSelection::Codes(codes) = selection {
        for code in codes {
            outcome.quantities.insert(code.clone(), 0);
        }
    }

    for entry in ordered {
        let running = outcome
            .quantities
            .entry(entry.item_code.clone())
            .or_insert(0);
        match entry.movement_kind.apply(*running, entry.quantity) {
            Some(next) => *running = next,
            None => outcome.anomalies.push(ReplayAnomaly::UnrecognizedKind {
                item_code: entry.item_code.clone(),
                entry_id: entry.id.clone(),
                kind: entry.movement_kind.to_string(),
            }),
        }
    }

    for (code, quantity) in &outcome.quantities {
        if *quantity < 0 {
            outcome.anomalies.push(ReplayAnomaly::NegativeQuantity {
                item_code: code.clone(),
                quantity: *quantity,
            });
        }
    }

    outcome
}

/// Last millisecond of `date` in the business time zone, as UTC.
pub fn end_of_day(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local_end = date.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::milliseconds(1);
    let utc = local_end - Duration::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, Utc)
}

/// Calendar date of `instant` in the business time zone.
pub fn business_date(instant: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    instant.with_timezone(&offset).date_naive()
}

/// Splits item codes into de-duplicated chunks of at most `limit` codes,
/// preserving first-seen order.
pub fn chunk_codes(codes: &[String], limit: usize) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    let unique: Vec<String> = codes
        .iter()
        .filter(|c| seen.insert(c.as_str()))
        .cloned()
        .collect();

    unique
        .chunks(limit.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
