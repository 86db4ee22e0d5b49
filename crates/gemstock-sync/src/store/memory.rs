//! In-process store with failure injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gemstock_core::validation::validate_new_entry;
use gemstock_core::{Clock, LedgerEntry, NewLedgerEntry, SystemClock, IN_FILTER_LIMIT};
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    check_in_filter, snapshot_batch, ChangeBatch, ChangeFeed, ChangeKind, DocumentChange,
    DocumentStore, FeedHub, LedgerQuery, LedgerStore,
};
use crate::error::{SyncError, SyncResult};

type Collection = BTreeMap<String, Value>;

struct MemoryInner {
    ledger: Mutex<Vec<LedgerEntry>>,
    documents: Mutex<BTreeMap<String, Collection>>,
    hub: FeedHub,
    clock: Arc<dyn Clock>,
    in_filter_limit: usize,
    offline: AtomicBool,
    subscriptions_fail: AtomicBool,
    failing_codes: Mutex<BTreeSet<String>>,
    queries: AtomicUsize,
    next_id: AtomicU64,
}

/// A store held entirely in memory. Clones share state.
///
/// Ledger entries keep insertion order, so entries sharing a timestamp
/// come back in the order they were appended.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Creates a store whose server timestamps come from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryStore {
            inner: Arc::new(MemoryInner {
                ledger: Mutex::new(Vec::new()),
                documents: Mutex::new(BTreeMap::new()),
                hub: FeedHub::default(),
                clock,
                in_filter_limit: IN_FILTER_LIMIT,
                offline: AtomicBool::new(false),
                subscriptions_fail: AtomicBool::new(false),
                failing_codes: Mutex::new(BTreeSet::new()),
                queries: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // =========================================================================
    // Test Controls
    // =========================================================================

    /// While offline every read and write fails with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes new subscriptions fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.inner.subscriptions_fail.store(fail, Ordering::SeqCst);
    }

    /// Makes every ledger query whose code list includes `item_code` fail
    /// with `StoreUnavailable`. Queries over all codes are unaffected.
    pub fn fail_queries_for(&self, item_code: impl Into<String>) {
        lock(&self.inner.failing_codes).insert(item_code.into());
    }

    /// Kills every live feed with a subscription error.
    pub fn break_feeds(&self, reason: &str) {
        self.inner.hub.fail_all(reason);
    }

    /// Number of ledger queries served so far.
    pub fn query_count(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.hub.subscriber_count()
    }

    /// Inserts a fully-formed entry without validation.
    pub fn insert_entry(&self, entry: LedgerEntry) {
        lock(&self.inner.ledger).push(entry);
    }

    /// Writes a document as another client would: stored as-is and
    /// announced to subscribers as a confirmed change.
    pub fn push_remote_change(&self, collection: &str, id: &str, data: Value) {
        let existed = lock(&self.inner.documents)
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data.clone())
            .is_some();
        let kind = if existed {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.inner.hub.emit(
            collection,
            ChangeBatch::confirmed(vec![DocumentChange::upsert(kind, id, data)]),
        );
    }

    /// Delivers `batch` to subscribers without touching stored documents.
    pub fn emit_raw_batch(&self, collection: &str, batch: ChangeBatch) {
        self.inner.hub.emit(collection, batch);
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("store is offline".into()));
        }
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    async fn query_ledger(&self, query: &LedgerQuery) -> SyncResult<Vec<LedgerEntry>> {
        self.ensure_online()?;
        check_in_filter(query, self.inner.in_filter_limit)?;
        if let Some(codes) = &query.item_codes {
            let failing = lock(&self.inner.failing_codes);
            if let Some(code) = codes.iter().find(|c| failing.contains(c.as_str())) {
                return Err(SyncError::StoreUnavailable(format!(
                    "query for {} failed",
                    code
                )));
            }
        }
        self.inner.queries.fetch_add(1, Ordering::SeqCst);

        let mut entries: Vec<LedgerEntry> = lock(&self.inner.ledger)
            .iter()
            .filter(|e| e.occurred_at <= query.until)
            .filter(|e| match &query.item_codes {
                Some(codes) => codes.iter().any(|c| c == &e.item_code),
                None => true,
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.occurred_at);

        debug!(
            codes = query.item_codes.as_ref().map(|c| c.len()),
            rows = entries.len(),
            "Memory ledger scan"
        );
        Ok(entries)
    }

    async fn append(&self, entry: NewLedgerEntry) -> SyncResult<LedgerEntry> {
        self.ensure_online()?;
        validate_new_entry(&entry)?;

        let id = format!("mem-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = entry.into_entry(id, self.inner.clock.now());
        lock(&self.inner.ledger).push(entry.clone());
        Ok(entry)
    }

    fn in_filter_limit(&self) -> usize {
        self.inner.in_filter_limit
    }
}

impl DocumentStore for MemoryStore {
    async fn get_document(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        self.ensure_online()?;
        Ok(lock(&self.inner.documents)
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn list_documents(&self, collection: &str) -> SyncResult<Vec<(String, Value)>> {
        self.ensure_online()?;
        Ok(lock(&self.inner.documents)
            .get(collection)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn merge_update(&self, collection: &str, id: &str, patch: Value) -> SyncResult<Value> {
        self.ensure_online()?;
        let Value::Object(patch) = patch else {
            return Err(SyncError::SerializationFailed(format!(
                "patch for {}/{} is not an object",
                collection, id
            )));
        };

        let (merged, kind) = {
            let mut documents = lock(&self.inner.documents);
            let docs = documents.entry(collection.to_string()).or_default();
            let kind = if docs.contains_key(id) {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            };
            let doc = docs
                .entry(id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !doc.is_object() {
                *doc = Value::Object(Map::new());
            }
            if let Value::Object(fields) = doc {
                fields.extend(patch);
            }
            (doc.clone(), kind)
        };

        // Local echo first, then the server acknowledgement.
        let change = DocumentChange::upsert(kind, id, merged.clone());
        self.inner
            .hub
            .emit(collection, ChangeBatch::pending(vec![change.clone()]));
        self.inner
            .hub
            .emit(collection, ChangeBatch::confirmed(vec![change]));

        Ok(merged)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> SyncResult<bool> {
        self.ensure_online()?;
        let removed = lock(&self.inner.documents)
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            self.inner.hub.emit(
                collection,
                ChangeBatch::confirmed(vec![DocumentChange::removed(id)]),
            );
        }
        Ok(removed)
    }

    async fn subscribe(&self, collection: &str) -> SyncResult<ChangeFeed> {
        self.ensure_online()?;
        if self.inner.subscriptions_fail.load(Ordering::SeqCst) {
            return Err(SyncError::SubscriptionFailed(
                "subscriptions are failing".into(),
            ));
        }

        // Listing and registering under the same lock keeps the initial
        // batch consistent with later changes.
        let documents = lock(&self.inner.documents);
        let (tx, feed) = self.inner.hub.register(collection);
        let existing: Vec<(String, Value)> = documents
            .get(collection)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        drop(documents);

        let _ = tx.send(super::FeedEvent::Batch(snapshot_batch(existing)));
        Ok(feed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
