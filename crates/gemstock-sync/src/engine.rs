//! # Stock Engine
//!
//! The one object a page talks to. Wires the replay engine, the cache, the
//! change-feed reconciler and the cross-tab synchronizer together and owns
//! their lifecycle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            StockEngine                                  │
//! │                                                                         │
//! │  compute_quantity / compute_quantities / refresh                        │
//! │        │                                                                │
//! │        ├─► CacheManager.get ── hit ──────────────────────────► value    │
//! │        │                                                                │
//! │        └─► StockReplayEngine / list_documents ── ok ──► put ─► value    │
//! │                         │                                               │
//! │                         └─ transient error ─► stale cache? ─► value     │
//! │                                                 │          + stale(true)│
//! │                                                 └─ none ─► Unavailable  │
//! │                                                                         │
//! │  record_movement ─► ledger append ─► invalidate affected stock keys     │
//! │                  └► aggregate merge_update ─► local LWW merge           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate};
use gemstock_core::ingest::category_document;
use gemstock_core::key::CacheTarget;
use gemstock_core::replay::business_date;
use gemstock_core::ttl::{business_offset, TtlPolicy};
use gemstock_core::validation::validate_item_code;
use gemstock_core::{
    CacheEntry, CachePayload, CategoryDocument, CategoryMap, CoreError, HistoryItem,
    ItemSelection, ItemTypeNode, LedgerEntry, NewLedgerEntry, StockSnapshot,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, MergeOrigin};
use crate::config::EngineConfig;
use crate::crosstab::{CrossTabHandle, CrossTabSynchronizer, PubSubPort};
use crate::error::{SyncError, SyncResult};
use crate::persist::PersistentTier;
use crate::reconciler::{ChangeFeedReconciler, ReconcilerHandle, ReconcilerOptions};
use crate::render::RenderSink;
use crate::replay::StockReplayEngine;
use crate::store::{DocumentStore, LedgerStore};

/// Settings the engine needs beyond the cache's own.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub category_collection: String,
    pub refetch_backoff: Duration,
    pub offset: FixedOffset,
    /// Largest chunk of item codes per ledger query.
    pub in_filter_limit: usize,
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> SyncResult<Self> {
        Ok(EngineOptions {
            category_collection: config.reconciler.category_collection.clone(),
            refetch_backoff: config.refetch_backoff(),
            offset: business_offset(config.replay.utc_offset_minutes)?,
            in_filter_limit: config.replay.in_filter_limit,
        })
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        let config = EngineConfig::default();
        EngineOptions {
            refetch_backoff: config.refetch_backoff(),
            offset: TtlPolicy::default().offset,
            in_filter_limit: config.replay.in_filter_limit,
            category_collection: config.reconciler.category_collection,
        }
    }
}

/// Where a movement lands in the aggregate category documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateTarget {
    pub category: String,
    pub item_type: String,
    /// Size, karat or similar; adjusts `details[subtype]` when set.
    pub subtype: Option<String>,
}

impl AggregateTarget {
    pub fn new(category: impl Into<String>, item_type: impl Into<String>) -> Self {
        AggregateTarget {
            category: category.into(),
            item_type: item_type.into(),
            subtype: None,
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }
}

pub struct StockEngine<S, P> {
    store: S,
    replay: StockReplayEngine<S>,
    cache: CacheManager<P>,
    render: Arc<dyn RenderSink>,
    options: EngineOptions,
    pubsub: Option<Arc<dyn PubSubPort>>,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    crosstab: Mutex<Option<CrossTabHandle>>,
}

impl<S, P> StockEngine<S, P>
where
    S: LedgerStore + DocumentStore + Clone,
    P: PersistentTier,
{
    pub fn new(
        store: S,
        cache: CacheManager<P>,
        options: EngineOptions,
        render: Arc<dyn RenderSink>,
    ) -> Self {
        StockEngine {
            replay: StockReplayEngine::new(store.clone(), options.offset)
                .with_chunk_limit(options.in_filter_limit),
            store,
            cache,
            render,
            options,
            pubsub: None,
            reconciler: Mutex::new(None),
            crosstab: Mutex::new(None),
        }
    }

    /// Joins a cross-tab bus. Must be called before [`StockEngine::init`].
    pub fn with_pubsub(mut self, port: Arc<dyn PubSubPort>) -> Self {
        self.cache.attach_pubsub(port.clone());
        self.pubsub = Some(port);
        self
    }

    pub fn cache(&self) -> &CacheManager<P> {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current business date.
    pub fn today(&self) -> NaiveDate {
        business_date(self.cache.now(), self.options.offset)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the cache's background tasks, the change-feed subscription and
    /// the cross-tab listener.
    pub fn init(&self) {
        self.cache.init();

        let mut reconciler = lock(&self.reconciler);
        if reconciler.is_none() {
            let handle = ChangeFeedReconciler::new(
                self.store.clone(),
                self.cache.clone(),
                Arc::clone(&self.render),
                ReconcilerOptions {
                    collection: self.options.category_collection.clone(),
                    refetch_backoff: self.options.refetch_backoff,
                    offset: self.options.offset,
                },
            )
            .start();
            *reconciler = Some(handle);
        }
        drop(reconciler);

        if let Some(port) = &self.pubsub {
            let mut crosstab = lock(&self.crosstab);
            if crosstab.is_none() {
                let sync = CrossTabSynchronizer::new(
                    self.cache.clone(),
                    Arc::clone(port),
                    Arc::clone(&self.render),
                );
                *crosstab = Some(sync.start());
            }
        }

        info!(collection = %self.options.category_collection, "Stock engine started");
    }

    /// Unsubscribes everything and flushes pending cache writes.
    pub async fn dispose(&self) {
        let reconciler = lock(&self.reconciler).take();
        if let Some(handle) = reconciler {
            handle.shutdown().await;
        }
        let crosstab = lock(&self.crosstab).take();
        if let Some(handle) = crosstab {
            handle.shutdown().await;
        }
        self.cache.dispose().await;
        info!("Stock engine stopped");
    }

    // =========================================================================
    // Quantities
    // =========================================================================

    /// Quantity of `item_code` at the end of `date`.
    pub async fn compute_quantity(&self, item_code: &str, date: NaiveDate) -> SyncResult<i64> {
        validate_item_code(item_code)?;
        let key = CacheTarget::Stock {
            item_code: item_code.to_string(),
            date,
        }
        .key();
        let entry = self.refresh(key.as_str(), false).await?;
        Ok(stock_quantity(&entry, item_code))
    }

    /// Quantities of the selected items at the end of `date`.
    ///
    /// Per-item results are cached under the same keys
    /// [`StockEngine::compute_quantity`] uses, so both forms agree.
    pub async fn compute_quantities(
        &self,
        selection: &ItemSelection,
        date: NaiveDate,
    ) -> SyncResult<BTreeMap<String, i64>> {
        let codes = match selection {
            ItemSelection::All => {
                let key = CacheTarget::AllStock { date }.key();
                let entry = self.refresh(key.as_str(), false).await?;
                return Ok(entry
                    .payload
                    .as_stock()
                    .map(|map| map.iter().map(|(code, s)| (code.clone(), s.quantity)).collect())
                    .unwrap_or_default());
            }
            ItemSelection::Codes(codes) => codes,
        };
        for code in codes {
            validate_item_code(code)?;
        }

        let mut quantities = BTreeMap::new();
        let mut missing: Vec<String> = Vec::new();
        for code in codes {
            if quantities.contains_key(code) || missing.contains(code) {
                continue;
            }
            match self.cache.get(stock_key(code, date).as_str()).await {
                Some(entry) => {
                    quantities.insert(code.clone(), stock_quantity(&entry, code));
                }
                None => missing.push(code.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(quantities);
        }

        debug!(cached = quantities.len(), missing = missing.len(), %date, "Replaying uncached codes");
        match self
            .replay
            .compute_quantities(&ItemSelection::Codes(missing.clone()), date)
            .await
        {
            Ok(outcome) => {
                for (code, snapshot) in outcome.snapshots(self.replay.cutoff(date)) {
                    quantities.insert(code.clone(), snapshot.quantity);
                    self.cache.put(
                        stock_key(&code, date),
                        single_stock(snapshot),
                        CacheTarget::Stock { item_code: code, date }.provenance(),
                    );
                }
                Ok(quantities)
            }
            Err(e) if e.is_retryable() => {
                for code in missing {
                    let key = stock_key(&code, date);
                    let Some(entry) = self.cache.peek_stale(&key).await else {
                        return Err(SyncError::Unavailable {
                            key,
                            reason: e.to_string(),
                        });
                    };
                    quantities.insert(code.clone(), stock_quantity(&entry, &code));
                }
                warn!(error = %e, "Serving cached quantities while the store is unreachable");
                self.render.stale(true);
                Ok(quantities)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Cache Access
    // =========================================================================

    /// Valid cached entry for `key`, if any. Never touches the store.
    pub async fn get_cached(&self, key: &str) -> Option<CacheEntry> {
        self.cache.get(key).await
    }

    /// Entry for `key`, rebuilt from the store when missing, expired or
    /// `force` is set.
    ///
    /// When the store is unreachable the newest cached entry is returned
    /// whatever its age and the render sink is told the data is stale. With
    /// nothing cached at all the call fails with [`SyncError::Unavailable`].
    pub async fn refresh(&self, key: &str, force: bool) -> SyncResult<CacheEntry> {
        let target = CacheTarget::parse(key)
            .ok_or_else(|| SyncError::Core(CoreError::UnknownCacheKey(key.to_string())))?;

        if !force {
            if let Some(entry) = self.cache.get(key).await {
                return Ok(entry);
            }
        }

        match self.load(&target).await {
            Ok(payload) => Ok(self.cache.put(key, payload, target.provenance())),
            Err(e) if e.is_retryable() => match self.cache.peek_stale(key).await {
                Some(entry) => {
                    warn!(key = %key, error = %e, "Serving stale cache entry");
                    self.render.stale(true);
                    Ok(entry)
                }
                None => Err(SyncError::Unavailable {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    async fn load(&self, target: &CacheTarget) -> SyncResult<CachePayload> {
        match target {
            CacheTarget::Stock { item_code, date } => {
                let snapshot = self.replay.snapshot(item_code, *date).await?;
                Ok(single_stock(snapshot))
            }
            CacheTarget::AllStock { date } => {
                let outcome = self
                    .replay
                    .compute_quantities(&ItemSelection::All, *date)
                    .await?;
                Ok(CachePayload::Stock(outcome.snapshots(self.replay.cutoff(*date))))
            }
            CacheTarget::Categories { .. } => {
                let documents = self
                    .store
                    .list_documents(&self.options.category_collection)
                    .await?;
                let mut categories = CategoryMap::new();
                for (id, data) in documents {
                    match category_document(&id, &data) {
                        Ok(document) => {
                            categories.insert(id, document);
                        }
                        Err(e) => warn!(doc_id = %id, error = %e, "Skipping malformed category document"),
                    }
                }
                Ok(CachePayload::Categories(categories))
            }
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Appends a movement to the ledger, drops every cached quantity it
    /// affects, and optionally applies it to an aggregate category document.
    pub async fn record_movement(
        &self,
        entry: NewLedgerEntry,
        aggregate: Option<AggregateTarget>,
    ) -> SyncResult<LedgerEntry> {
        let appended = self.store.append(entry).await?;
        info!(
            item_code = %appended.item_code,
            kind = %appended.movement_kind,
            quantity = appended.quantity,
            "Movement recorded"
        );

        let from = business_date(appended.occurred_at, self.options.offset);
        self.invalidate_affected(&appended.item_code, from).await;

        if let Some(target) = aggregate {
            self.apply_to_aggregate(&appended, &target).await?;
        }
        Ok(appended)
    }

    /// Drops every stock entry a movement on `item_code` dated `from` makes
    /// wrong, whether it is held in process or was persisted by an earlier
    /// session.
    async fn invalidate_affected(&self, item_code: &str, from: NaiveDate) {
        let mut keys: BTreeSet<String> = self.cache.keys().into_iter().collect();
        match self.cache.tier().keys().await {
            Ok(stored) => keys.extend(
                stored
                    .iter()
                    .filter_map(|storage_key| self.cache.cache_key(storage_key))
                    .map(str::to_string),
            ),
            Err(e) => warn!(error = %e, "Could not list persisted keys; invalidating in-process entries only"),
        }

        for key in keys {
            let affected = match CacheTarget::parse(&key) {
                Some(CacheTarget::Stock { item_code: code, date }) => code == item_code && date >= from,
                Some(CacheTarget::AllStock { date }) => date >= from,
                _ => false,
            };
            if affected {
                self.cache.invalidate(&key).await;
                self.render.render(&key);
            }
        }
    }

    async fn apply_to_aggregate(&self, entry: &LedgerEntry, target: &AggregateTarget) -> SyncResult<()> {
        let collection = &self.options.category_collection;
        let current = self.store.get_document(collection, &target.category).await?;
        let mut node = current
            .as_ref()
            .and_then(|data| category_document(&target.category, data).ok())
            .and_then(|mut document| document.remove(&target.item_type))
            .unwrap_or_else(|| ItemTypeNode::new(entry.occurred_at));

        let item = HistoryItem {
            kind: entry.movement_kind.clone(),
            quantity: entry.quantity,
            at: entry.occurred_at,
            subtype: target.subtype.clone(),
            note: entry.note.clone(),
            actor: entry.actor.clone(),
        };
        if !node.record_movement(item) {
            warn!(
                item_code = %entry.item_code,
                kind = %entry.movement_kind,
                "Unrecognized movement kind; aggregate left unchanged"
            );
            return Ok(());
        }

        let mut patch = serde_json::Map::new();
        patch.insert(target.item_type.clone(), serde_json::to_value(&node)?);
        self.store
            .merge_update(collection, &target.category, Value::Object(patch))
            .await?;

        let mut document = CategoryDocument::new();
        document.insert(target.item_type.clone(), node);
        let key = CacheTarget::Categories { date: self.today() }.key();
        if self.cache.merge_category_document(
            key.as_str(),
            &target.category,
            &document,
            MergeOrigin::LocalWrite,
        ) {
            self.render.render(key.as_str());
        }
        Ok(())
    }
}

fn stock_key(item_code: &str, date: NaiveDate) -> String {
    CacheTarget::Stock {
        item_code: item_code.to_string(),
        date,
    }
    .key()
    .into_string()
}

fn single_stock(snapshot: StockSnapshot) -> CachePayload {
    let mut map = BTreeMap::new();
    map.insert(snapshot.item_code.clone(), snapshot);
    CachePayload::Stock(map)
}

fn stock_quantity(entry: &CacheEntry, item_code: &str) -> i64 {
    entry
        .payload
        .as_stock()
        .and_then(|map| map.get(item_code))
        .map(|snapshot| snapshot.quantity)
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
