//! # Store Ports
//!
//! The engine talks to the remote ledger/aggregate store through two traits:
//!
//! ```text
//! ┌───────────────────┐        ┌────────────────────────────────────────┐
//! │  StockReplayEngine│──────► │ LedgerStore                            │
//! │                   │        │  query_ledger(until, codes ≤ limit)    │
//! │  StockEngine      │──────► │  append(new entry) → server timestamp  │
//! └───────────────────┘        └────────────────────────────────────────┘
//! ┌───────────────────┐        ┌────────────────────────────────────────┐
//! │  Reconciler       │──────► │ DocumentStore                          │
//! │  StockEngine      │        │  get / list / merge_update / delete    │
//! │                   │ ◄───── │  subscribe(collection) → ChangeFeed    │
//! └───────────────────┘        └────────────────────────────────────────┘
//! ```
//!
//! [`MemoryStore`] is an in-process store with failure injection;
//! [`SqliteStore`] sits on top of `gemstock-db`.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use gemstock_core::{LedgerEntry, NewLedgerEntry, IN_FILTER_LIMIT};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// =============================================================================
// Ledger Port
// =============================================================================

/// A ledger scan: every entry with `occurred_at <= until`, optionally
/// restricted to a set of item codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    pub until: DateTime<Utc>,
    /// `None` scans every code. `Some` must respect the store's IN limit.
    pub item_codes: Option<Vec<String>>,
}

impl LedgerQuery {
    pub fn all(until: DateTime<Utc>) -> Self {
        LedgerQuery {
            until,
            item_codes: None,
        }
    }

    pub fn codes(until: DateTime<Utc>, item_codes: Vec<String>) -> Self {
        LedgerQuery {
            until,
            item_codes: Some(item_codes),
        }
    }
}

pub trait LedgerStore: Send + Sync + 'static {
    /// Entries matching `query`, ascending by `occurred_at`.
    fn query_ledger(
        &self,
        query: &LedgerQuery,
    ) -> impl Future<Output = SyncResult<Vec<LedgerEntry>>> + Send;

    /// Validates and appends a movement; the store assigns id and timestamp.
    fn append(&self, entry: NewLedgerEntry) -> impl Future<Output = SyncResult<LedgerEntry>> + Send;

    /// Largest `item_codes` list a single query may carry.
    fn in_filter_limit(&self) -> usize {
        IN_FILTER_LIMIT
    }
}

// =============================================================================
// Document Port
// =============================================================================

pub trait DocumentStore: Send + Sync + 'static {
    fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<Option<Value>>> + Send;

    /// Every document of `collection` as `(id, data)`.
    fn list_documents(
        &self,
        collection: &str,
    ) -> impl Future<Output = SyncResult<Vec<(String, Value)>>> + Send;

    /// Merges the top-level fields of `patch` into the document (creating it
    /// if missing) without touching other fields. Returns the merged data.
    fn merge_update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> impl Future<Output = SyncResult<Value>> + Send;

    fn delete_document(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Opens a live query on `collection`. The first batch lists every
    /// existing document as [`ChangeKind::Added`].
    fn subscribe(&self, collection: &str) -> impl Future<Output = SyncResult<ChangeFeed>> + Send;
}

// =============================================================================
// Change Feed
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One changed document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub doc_id: String,
    /// Document data; `None` for removals.
    pub data: Option<Value>,
}

impl DocumentChange {
    pub fn upsert(kind: ChangeKind, doc_id: impl Into<String>, data: Value) -> Self {
        DocumentChange {
            kind,
            doc_id: doc_id.into(),
            data: Some(data),
        }
    }

    pub fn removed(doc_id: impl Into<String>) -> Self {
        DocumentChange {
            kind: ChangeKind::Removed,
            doc_id: doc_id.into(),
            data: None,
        }
    }
}

/// A batch of changes delivered together.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
    /// Set when the batch is the local echo of this client's own
    /// unconfirmed write.
    pub has_pending_writes: bool,
    /// Set when the batch lists the whole collection rather than a delta.
    pub complete: bool,
}

impl ChangeBatch {
    pub fn confirmed(changes: Vec<DocumentChange>) -> Self {
        ChangeBatch {
            changes,
            has_pending_writes: false,
            complete: false,
        }
    }

    pub fn pending(changes: Vec<DocumentChange>) -> Self {
        ChangeBatch {
            changes,
            has_pending_writes: true,
            complete: false,
        }
    }

    /// Every document of a collection, as listed by a fresh subscription or
    /// a full read.
    pub fn snapshot(changes: Vec<DocumentChange>) -> Self {
        ChangeBatch {
            changes,
            has_pending_writes: false,
            complete: true,
        }
    }
}

#[derive(Debug)]
pub enum FeedEvent {
    Batch(ChangeBatch),
    /// The subscription died. No further events follow.
    Error(SyncError),
}

/// Receiving end of a live query. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<FeedEvent>) -> Self {
        ChangeFeed { rx }
    }

    /// Next event, or `None` once the store closed the feed.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }
}

// =============================================================================
// Feed Hub
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    collection: String,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

/// Fan-out of change batches to live subscribers, shared by the store
/// adapters.
#[derive(Debug, Clone, Default)]
pub(crate) struct FeedHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl FeedHub {
    /// Registers a subscriber and returns its sender (for the initial batch)
    /// together with the feed.
    pub(crate) fn register(&self, collection: &str) -> (mpsc::UnboundedSender<FeedEvent>, ChangeFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.push(Subscriber {
            collection: collection.to_string(),
            tx: tx.clone(),
        });
        debug!(collection, subscribers = subscribers.len(), "Feed subscriber registered");
        (tx, ChangeFeed::new(rx))
    }

    pub(crate) fn emit(&self, collection: &str, batch: ChangeBatch) {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter().filter(|s| s.collection == collection) {
            let _ = subscriber.tx.send(FeedEvent::Batch(batch.clone()));
        }
    }

    /// Errors every live feed and drops it.
    pub(crate) fn fail_all(&self, reason: &str) {
        let mut subscribers = self.lock();
        for subscriber in subscribers.drain(..) {
            let _ = subscriber
                .tx
                .send(FeedEvent::Error(SyncError::SubscriptionFailed(reason.to_string())));
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Initial batch of a fresh subscription.
pub(crate) fn snapshot_batch(documents: Vec<(String, Value)>) -> ChangeBatch {
    ChangeBatch::snapshot(
        documents
            .into_iter()
            .map(|(id, data)| DocumentChange::upsert(ChangeKind::Added, id, data))
            .collect(),
    )
}

/// Rejects `item_codes` lists longer than `limit`.
pub(crate) fn check_in_filter(query: &LedgerQuery, limit: usize) -> SyncResult<()> {
    match &query.item_codes {
        Some(codes) if codes.len() > limit => Err(SyncError::QueryLimitExceeded {
            requested: codes.len(),
            limit,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_routes_by_collection() {
        let hub = FeedHub::default();
        let (_, mut cats) = hub.register("stockCategories");
        let (_, mut other) = hub.register("sales");

        hub.emit(
            "stockCategories",
            ChangeBatch::confirmed(vec![DocumentChange::removed("gold")]),
        );
        hub.emit("sales", ChangeBatch::pending(vec![]));

        match cats.next().await {
            Some(FeedEvent::Batch(batch)) => {
                assert_eq!(batch.changes[0].doc_id, "gold");
                assert!(!batch.has_pending_writes);
            }
            other => panic!("unexpected {:?}", other),
        }
        match other.next().await {
            Some(FeedEvent::Batch(batch)) => assert!(batch.has_pending_writes),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_feed_is_pruned() {
        let hub = FeedHub::default();
        let (_, feed) = hub.register("c");
        assert_eq!(hub.subscriber_count(), 1);
        drop(feed);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_sends_error_then_closes() {
        let hub = FeedHub::default();
        let (tx, mut feed) = hub.register("c");
        drop(tx);
        hub.fail_all("connection reset");

        assert!(matches!(
            feed.next().await,
            Some(FeedEvent::Error(SyncError::SubscriptionFailed(_)))
        ));
        assert!(feed.next().await.is_none());
    }

    #[test]
    fn test_in_filter_check() {
        let until = Utc::now();
        let codes: Vec<String> = (0..11).map(|i| format!("C{}", i)).collect();
        assert!(check_in_filter(&LedgerQuery::codes(until, codes), 10).is_err());
        assert!(check_in_filter(&LedgerQuery::all(until), 10).is_ok());

        let batch = snapshot_batch(vec![("gold".into(), json!({}))]);
        assert_eq!(batch.changes[0].kind, ChangeKind::Added);
        assert!(batch.complete);
        assert!(!ChangeBatch::confirmed(vec![]).complete);
    }
}
