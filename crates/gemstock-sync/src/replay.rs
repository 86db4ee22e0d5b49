//! # Stock Replay Engine
//!
//! Computes quantities by folding the ledger from scratch.
//!
//! ```text
//! codes ──► dedupe ──► chunks of ≤ in_filter_limit
//!                         │  │  │
//!                         ▼  ▼  ▼        (concurrent, all-or-fail)
//!                    query_ledger(until = end_of_day(date), chunk)
//!                         │  │  │
//!                         └──┼──┘
//!                            ▼
//!                 concatenate ──► replay() ──► quantities + anomalies
//! ```
//!
//! Folding the concatenated entries once (rather than per chunk) keeps
//! batch results identical to single-item results.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use futures_util::future::try_join_all;
use gemstock_core::replay::{chunk_codes, end_of_day, replay, ReplayAnomaly, ReplayOutcome};
use gemstock_core::{ItemSelection, StockSnapshot};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::store::{LedgerQuery, LedgerStore};

pub struct StockReplayEngine<S> {
    store: S,
    offset: FixedOffset,
    chunk_limit: usize,
}

impl<S: LedgerStore> StockReplayEngine<S> {
    /// `offset` is the business day's UTC offset, used for end-of-day
    /// cutoffs.
    pub fn new(store: S, offset: FixedOffset) -> Self {
        let chunk_limit = store.in_filter_limit();
        StockReplayEngine {
            store,
            offset,
            chunk_limit,
        }
    }

    /// Caps chunks below the store's own IN-filter limit.
    pub fn with_chunk_limit(mut self, limit: usize) -> Self {
        self.chunk_limit = limit.clamp(1, self.store.in_filter_limit());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Inclusive replay cutoff for `date`.
    pub fn cutoff(&self, date: NaiveDate) -> DateTime<Utc> {
        end_of_day(date, self.offset)
    }

    /// Quantity of `item_code` at the end of `date`. 0 if it has no entries.
    pub async fn compute_quantity(&self, item_code: &str, date: NaiveDate) -> SyncResult<i64> {
        let outcome = self
            .compute_quantities(&ItemSelection::codes([item_code]), date)
            .await?;
        Ok(outcome.quantity_of(item_code))
    }

    /// Quantities of the selected items at the end of `date`.
    ///
    /// Fails as a whole if any chunk query fails.
    pub async fn compute_quantities(
        &self,
        selection: &ItemSelection,
        date: NaiveDate,
    ) -> SyncResult<ReplayOutcome> {
        let until = self.cutoff(date);

        let entries = match selection {
            ItemSelection::All => self.store.query_ledger(&LedgerQuery::all(until)).await?,
            ItemSelection::Codes(codes) => {
                let chunks = chunk_codes(codes, self.chunk_limit);
                debug!(codes = codes.len(), chunks = chunks.len(), %date, "Replaying ledger");
                let queries: Vec<LedgerQuery> = chunks
                    .into_iter()
                    .map(|chunk| LedgerQuery::codes(until, chunk))
                    .collect();
                try_join_all(queries.iter().map(|q| self.store.query_ledger(q)))
                    .await?
                    .into_iter()
                    .flatten()
                    .collect()
            }
        };

        let outcome = replay(&entries, until, selection);
        log_anomalies(&outcome.anomalies);
        Ok(outcome)
    }

    /// Single-item snapshot at the end of `date`.
    pub async fn snapshot(&self, item_code: &str, date: NaiveDate) -> SyncResult<StockSnapshot> {
        let quantity = self.compute_quantity(item_code, date).await?;
        Ok(StockSnapshot {
            item_code: item_code.to_string(),
            quantity,
            as_of: self.cutoff(date),
        })
    }
}

fn log_anomalies(anomalies: &[ReplayAnomaly]) {
    for anomaly in anomalies {
        match anomaly {
            ReplayAnomaly::UnrecognizedKind {
                item_code,
                entry_id,
                kind,
            } => warn!(
                item_code = %item_code,
                entry_id = %entry_id,
                kind = %kind,
                "Skipped ledger entry with unrecognized movement kind"
            ),
            ReplayAnomaly::NegativeQuantity {
                item_code,
                quantity,
            } => warn!(
                item_code = %item_code,
                quantity,
                "Replayed quantity is negative"
            ),
        }
    }
}
