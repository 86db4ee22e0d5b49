//! # Cache Manager
//!
//! Two-level cache for replayed stock and aggregate category documents.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CacheManager                                   │
//! │                                                                         │
//! │  get(key)                                                               │
//! │    │                                                                    │
//! │    ├─► in-process map ── valid? ──► hit                                 │
//! │    │                                                                    │
//! │    └─► persistent tier ── parses? version ok? valid? ──► promote, hit   │
//! │              │                                                          │
//! │              └─ parse error / version mismatch ──► purge, miss          │
//! │                                                                         │
//! │  put / merge ──► in-process map ──► dirty set ──► DebouncedWriter       │
//! │                                                     │                   │
//! │                                                     ▼                   │
//! │                                    per-key write, PubSubPort publish    │
//! │                                                                         │
//! │  sweeper (every sweep_interval): drop entries older than the long TTL   │
//! │  from both levels, whatever their key class.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-process map is authoritative; the persistent tier is a
//! best-effort mirror. No lock is held across an await point.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gemstock_core::merge::{merge_category, merge_category_map};
use gemstock_core::ttl::TtlPolicy;
use gemstock_core::{
    CacheEntry, CachePayload, CategoryDocument, CategoryMap, Clock, PersistedEntry, Provenance,
    SCHEMA_VERSION,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::crosstab::PubSubPort;
use crate::error::SyncResult;
use crate::persist::{PersistError, PersistentTier};
use crate::writer::{DebouncedWriter, WriterHandle};

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: TtlPolicy,
    pub schema_version: u32,
    /// Prepended to every key written to the persistent tier.
    pub key_prefix: String,
    pub debounce: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            ttl: TtlPolicy::default(),
            schema_version: SCHEMA_VERSION,
            key_prefix: "gemstock.cache.".to_string(),
            debounce: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(1800),
        }
    }
}

impl CacheOptions {
    pub fn from_config(config: &EngineConfig) -> SyncResult<Self> {
        Ok(CacheOptions {
            ttl: config.ttl_policy()?,
            schema_version: config.cache.schema_version,
            key_prefix: config.cache.key_prefix.clone(),
            debounce: config.debounce(),
            sweep_interval: config.sweep_interval(),
        })
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Where a merge came from. Sibling-tab merges are not written back, since
/// the sibling already persisted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    RemoteFeed,
    SiblingTab,
    LocalWrite,
}

impl MergeOrigin {
    fn persists(self) -> bool {
        !matches!(self, MergeOrigin::SiblingTab)
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: Vec<String>,
    pub failed: Vec<String>,
    /// Entries dropped by the eviction pass a quota error triggered.
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
}

// =============================================================================
// Cache Manager
// =============================================================================

pub(crate) struct CacheInner<P> {
    tier: P,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    dirty: Mutex<BTreeSet<String>>,
    counters: Counters,
    writer: Mutex<Option<WriterHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    pubsub: Mutex<Option<Arc<dyn PubSubPort>>>,
}

/// Handle to the shared cache. Clones share state.
pub struct CacheManager<P> {
    inner: Arc<CacheInner<P>>,
}

impl<P> Clone for CacheManager<P> {
    fn clone(&self) -> Self {
        CacheManager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PersistentTier> CacheManager<P> {
    pub fn new(tier: P, options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        CacheManager {
            inner: Arc::new(CacheInner {
                tier,
                options,
                clock,
                entries: RwLock::new(HashMap::new()),
                dirty: Mutex::new(BTreeSet::new()),
                counters: Counters::default(),
                writer: Mutex::new(None),
                sweeper: Mutex::new(None),
                pubsub: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CacheInner<P>>) -> Self {
        CacheManager { inner }
    }

    /// Announces successful writes and invalidations to sibling tabs.
    pub fn attach_pubsub(&self, port: Arc<dyn PubSubPort>) {
        *lock(&self.inner.pubsub) = Some(port);
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    pub fn tier(&self) -> &P {
        &self.inner.tier
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Key under which `key` is stored in the persistent tier.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.options.key_prefix, key)
    }

    /// Inverse of [`CacheManager::storage_key`]; `None` for foreign keys.
    pub fn cache_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key.strip_prefix(self.inner.options.key_prefix.as_str())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the debounced writer and the periodic sweeper. Must be called
    /// from within a tokio runtime. Calling it twice is a no-op.
    pub fn init(&self) {
        let mut writer = lock(&self.inner.writer);
        if writer.is_some() {
            return;
        }
        *writer = Some(DebouncedWriter::spawn(
            Arc::downgrade(&self.inner),
            self.inner.options.debounce,
        ));
        drop(writer);

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.sweep_interval;
        let sweeper = tokio::spawn(sweep_loop(weak, period));
        *lock(&self.inner.sweeper) = Some(sweeper);

        info!(
            debounce_ms = self.inner.options.debounce.as_millis() as u64,
            sweep_secs = period.as_secs(),
            "Cache manager started"
        );
    }

    /// Stops background tasks and forces a final flush of pending writes.
    pub async fn dispose(&self) -> FlushReport {
        let writer = lock(&self.inner.writer).take();
        if let Some(writer) = writer {
            writer.shutdown().await;
        }
        let sweeper = lock(&self.inner.sweeper).take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let report = self.flush_dirty().await;
        info!(
            written = report.written.len(),
            failed = report.failed.len(),
            "Cache manager disposed"
        );
        report
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Valid entry for `key`, promoting it from the persistent tier if the
    /// in-process map has nothing fresh.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.now();
        let fresh = read(&self.inner.entries)
            .get(key)
            .filter(|entry| self.inner.options.ttl.is_valid(key, entry.written_at, now))
            .cloned();
        if let Some(entry) = fresh {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        match self.load_from_tier(key).await {
            Some(entry) if self.inner.options.ttl.is_valid(key, entry.written_at, now) => {
                debug!(key = %key, "Promoted cache entry from persistent tier");
                write(&self.inner.entries).insert(key.to_string(), entry.clone());
                self.inner.counters.promotions.fetch_add(1, Ordering::Relaxed);
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            _ => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Newest entry for `key` whatever its age, for stale-but-available
    /// fallbacks.
    pub async fn peek_stale(&self, key: &str) -> Option<CacheEntry> {
        let local = read(&self.inner.entries).get(key).cloned();
        let persisted = self.load_from_tier(key).await;
        match (local, persisted) {
            (Some(local), Some(persisted)) if persisted.written_at > local.written_at => {
                Some(persisted)
            }
            (Some(local), _) => Some(local),
            (None, persisted) => persisted,
        }
    }

    /// Keys currently held in process.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.inner.entries).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            entries: read(&self.inner.entries).len(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            promotions: counters.promotions.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Reads, parses and version-checks the persisted entry for `key`.
    /// Unreadable or mismatched entries are purged.
    async fn load_from_tier(&self, key: &str) -> Option<CacheEntry> {
        let storage_key = self.storage_key(key);
        let raw = match self.inner.tier.read(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent tier read failed");
                return None;
            }
        };

        match self.decode(key, &raw) {
            Some(entry) => Some(entry),
            None => {
                self.purge(&storage_key).await;
                None
            }
        }
    }

    /// Parses a persisted value. `None` for malformed JSON, a different
    /// schema version or an unrepresentable timestamp.
    pub(crate) fn decode(&self, key: &str, raw: &str) -> Option<CacheEntry> {
        let persisted: PersistedEntry = match serde_json::from_str(raw) {
            Ok(persisted) => persisted,
            Err(e) => {
                debug!(key = %key, error = %e, "Unparsable persisted entry");
                return None;
            }
        };
        if persisted.version != self.inner.options.schema_version {
            debug!(
                key = %key,
                found = persisted.version,
                expected = self.inner.options.schema_version,
                "Persisted entry has a different schema version"
            );
            return None;
        }
        persisted.into_entry(key)
    }

    async fn purge(&self, storage_key: &str) {
        if let Err(e) = self.inner.tier.remove(storage_key).await {
            warn!(key = %storage_key, error = %e, "Failed to purge persisted entry");
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores a fresh value and schedules it for persistence. Returns the
    /// stored entry.
    pub fn put(
        &self,
        key: impl Into<String>,
        payload: CachePayload,
        source: Provenance,
    ) -> CacheEntry {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            source,
            version: self.inner.options.schema_version,
            written_at: self.now(),
        };
        write(&self.inner.entries).insert(key.clone(), entry.clone());
        self.mark_dirty(key);
        entry
    }

    /// Drops `key` from both levels and tells sibling tabs.
    pub async fn invalidate(&self, key: &str) {
        write(&self.inner.entries).remove(key);
        lock(&self.inner.dirty).remove(key);

        let storage_key = self.storage_key(key);
        self.purge(&storage_key).await;
        self.publish(&storage_key, None);
        debug!(key = %key, "Cache entry invalidated");
    }

    /// Drops `key` from the in-process map only, without touching the
    /// persistent tier or telling siblings. Returns whether it was held.
    pub fn forget(&self, key: &str) -> bool {
        lock(&self.inner.dirty).remove(key);
        write(&self.inner.entries).remove(key).is_some()
    }

    /// Drops every entry this cache owns from both levels.
    pub async fn invalidate_all(&self) {
        write(&self.inner.entries).clear();
        lock(&self.inner.dirty).clear();

        match self.inner.tier.keys().await {
            Ok(keys) => {
                for storage_key in keys {
                    if self.cache_key(&storage_key).is_some() {
                        self.purge(&storage_key).await;
                        self.publish(&storage_key, None);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list persisted keys"),
        }
        info!("Cache invalidated");
    }

    /// Merges one category document into the categories entry at `key`
    /// (last-write-wins per item type). Returns whether anything changed.
    ///
    /// An absent entry stays absent: one document is not the whole
    /// collection, and the next read loads it in full.
    pub fn merge_category_document(
        &self,
        key: &str,
        category: &str,
        document: &CategoryDocument,
        origin: MergeOrigin,
    ) -> bool {
        self.update_categories(key, origin, false, |map| {
            merge_category(map, category, document)
        })
    }

    /// Merges a complete category map, such as a sibling tab's entry or a
    /// full listing of the collection. Creates the entry when absent.
    pub fn merge_category_map(&self, key: &str, incoming: &CategoryMap, origin: MergeOrigin) -> bool {
        self.update_categories(key, origin, true, |map| merge_category_map(map, incoming))
    }

    /// Removes one category from the entry at `key`, if there is one.
    pub fn remove_category(&self, key: &str, category: &str, origin: MergeOrigin) -> bool {
        self.update_categories(key, origin, false, |map| map.remove(category).is_some())
    }

    fn update_categories<F>(&self, key: &str, origin: MergeOrigin, create: bool, apply: F) -> bool
    where
        F: FnOnce(&mut CategoryMap) -> bool,
    {
        let now = self.now();
        let changed = {
            let mut entries = write(&self.inner.entries);
            let holds_categories = entries
                .get(key)
                .is_some_and(|entry| matches!(entry.payload, CachePayload::Categories(_)));
            if !holds_categories && !create {
                debug!(key = %key, "No complete categories entry to merge into");
                return false;
            }

            let entry = entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
                key: key.to_string(),
                payload: CachePayload::Categories(BTreeMap::new()),
                source: Provenance::AggregateDerived,
                version: self.inner.options.schema_version,
                written_at: now,
            });
            if !holds_categories {
                entry.payload = CachePayload::Categories(BTreeMap::new());
                entry.source = Provenance::AggregateDerived;
            }

            let changed = match &mut entry.payload {
                CachePayload::Categories(map) => apply(map),
                _ => false,
            };
            if changed {
                entry.written_at = now;
            }
            changed
        };

        if changed && origin.persists() {
            self.mark_dirty(key.to_string());
        }
        changed
    }

    /// Replaces the in-process entry with `incoming` when it is strictly
    /// newer and differs. Used for non-category payloads from sibling tabs.
    pub fn accept_if_newer(&self, incoming: CacheEntry) -> bool {
        let mut entries = write(&self.inner.entries);
        let replace = match entries.get(&incoming.key) {
            None => true,
            Some(current) => {
                incoming.written_at > current.written_at && current.payload != incoming.payload
            }
        };
        if replace {
            entries.insert(incoming.key.clone(), incoming);
        }
        replace
    }

    fn mark_dirty(&self, key: String) {
        lock(&self.inner.dirty).insert(key);
        let writer = lock(&self.inner.writer).clone();
        if let Some(writer) = writer {
            writer.schedule_flush();
        }
    }

    fn publish(&self, storage_key: &str, value: Option<&str>) {
        let port = lock(&self.inner.pubsub).clone();
        if let Some(port) = port {
            port.publish(storage_key, value);
        }
    }

    // =========================================================================
    // Flush & Sweep
    // =========================================================================

    /// Writes every dirty key to the persistent tier, each in isolation.
    ///
    /// A failed key is logged and left out until it is mutated again. The
    /// first quota error of a cycle triggers one eviction pass; the failed
    /// write is not retried.
    ///
    /// The in-process entry may change while a write is in flight. If it
    /// was dropped, the persisted copy is removed again; if it was replaced,
    /// the key is marked dirty for the next cycle.
    pub async fn flush_dirty(&self) -> FlushReport {
        let keys: Vec<String> = std::mem::take(&mut *lock(&self.inner.dirty))
            .into_iter()
            .collect();
        let mut report = FlushReport::default();
        if keys.is_empty() {
            return report;
        }

        let mut evicted_this_cycle = false;
        for key in keys {
            let Some(entry) = read(&self.inner.entries).get(&key).cloned() else {
                continue;
            };

            let json = match serde_json::to_string(&PersistedEntry::from_entry(&entry)) {
                Ok(json) => json,
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not serialize cache entry");
                    report.failed.push(key);
                    continue;
                }
            };

            let storage_key = self.storage_key(&key);
            match self.inner.tier.write(&storage_key, &json).await {
                Ok(()) => {
                    let current = read(&self.inner.entries).get(&key).cloned();
                    match current {
                        Some(current) if current == entry => {
                            self.publish(&storage_key, Some(&json));
                            report.written.push(key);
                        }
                        Some(_) => {
                            debug!(key = %key, "Entry replaced during write; flushing again");
                            self.mark_dirty(key);
                        }
                        None => {
                            debug!(key = %key, "Entry dropped during write; removing persisted copy");
                            self.purge(&storage_key).await;
                        }
                    }
                }
                Err(PersistError::QuotaExceeded { .. }) => {
                    warn!(key = %key, bytes = json.len(), "Persistent tier quota exceeded");
                    report.failed.push(key);
                    if !evicted_this_cycle {
                        evicted_this_cycle = true;
                        report.evicted += self.sweep().await;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to persist cache entry");
                    report.failed.push(key);
                }
            }
        }

        debug!(
            written = report.written.len(),
            failed = report.failed.len(),
            evicted = report.evicted,
            "Flush complete"
        );
        report
    }

    /// Removes entries older than the long TTL from both levels, along with
    /// persisted entries that no longer parse. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.now();
        let ttl = self.inner.options.ttl;

        let expired: Vec<String> = {
            let mut entries = write(&self.inner.entries);
            let expired: Vec<String> = entries
                .values()
                .filter(|entry| ttl.is_sweepable(entry.written_at, now))
                .map(|entry| entry.key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };
        {
            let mut dirty = lock(&self.inner.dirty);
            for key in &expired {
                dirty.remove(key);
            }
        }
        let mut removed = expired.len();

        let storage_keys = match self.inner.tier.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Could not list persisted keys for sweep");
                Vec::new()
            }
        };
        for storage_key in storage_keys {
            let Some(key) = self.cache_key(&storage_key) else {
                continue;
            };
            let raw = match self.inner.tier.read(&storage_key).await {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            let drop_it = match self.decode(key, &raw) {
                Some(entry) => ttl.is_sweepable(entry.written_at, now),
                None => true,
            };
            if drop_it {
                self.purge(&storage_key).await;
                removed += 1;
            }
        }

        if removed > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "Cache sweep evicted entries");
        }
        removed
    }
}

async fn sweep_loop<P: PersistentTier>(weak: Weak<CacheInner<P>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        CacheManager::from_inner(inner).sweep().await;
    }
    debug!("Cache sweeper stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryTier, PersistResult};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tokio::sync::Notify;
    use gemstock_core::{ItemTypeNode, ManualClock, StockSnapshot};
    use serde_json::json;

    const TODAY_KEY: &str = "stock:X70:2026-10-16";
    const OLD_KEY: &str = "stock:X70:2026-10-01";

    fn start() -> DateTime<Utc> {
        // 10:00 on 2026-10-16 at UTC+7
        Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap()
    }

    fn setup(tier: MemoryTier) -> (CacheManager<MemoryTier>, ManualClock) {
        let clock = ManualClock::new(start());
        let cache = CacheManager::new(tier, CacheOptions::default(), Arc::new(clock.clone()));
        (cache, clock)
    }

    fn stock(quantity: i64) -> CachePayload {
        let mut map = BTreeMap::new();
        map.insert(
            "X70".to_string(),
            StockSnapshot {
                item_code: "X70".to_string(),
                quantity,
                as_of: start(),
            },
        );
        CachePayload::Stock(map)
    }

    fn node(quantity: i64, minute: i64) -> ItemTypeNode {
        let mut node = ItemTypeNode::new(start() + ChronoDuration::minutes(minute));
        node.quantity = quantity;
        node
    }

    /// Memory tier whose writes wait for [`GatedTier::open`].
    #[derive(Clone, Default)]
    struct GatedTier {
        inner: MemoryTier,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    impl GatedTier {
        fn open(&self) {
            self.gate.notify_one();
        }
    }

    impl PersistentTier for GatedTier {
        async fn read(&self, key: &str) -> PersistResult<Option<String>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: &str) -> PersistResult<()> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.write(key, value).await
        }

        async fn remove(&self, key: &str) -> PersistResult<()> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> PersistResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_today_key_expires_after_short_ttl() {
        let (cache, clock) = setup(MemoryTier::new());
        cache.put(TODAY_KEY, stock(6), Provenance::LedgerDerived);
        cache.put(OLD_KEY, stock(4), Provenance::LedgerDerived);

        clock.advance(ChronoDuration::seconds(300) - ChronoDuration::milliseconds(1));
        assert!(cache.get(TODAY_KEY).await.is_some());

        clock.advance(ChronoDuration::milliseconds(2));
        assert!(cache.get(TODAY_KEY).await.is_none());
        assert!(cache.get(OLD_KEY).await.is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_promotes_from_persistent_tier() {
        let tier = MemoryTier::new();
        let (writer, _) = setup(tier.clone());
        writer.put(OLD_KEY, stock(4), Provenance::LedgerDerived);
        let report = writer.flush_dirty().await;
        assert_eq!(report.written, vec![OLD_KEY.to_string()]);

        // A fresh session over the same tier.
        let (reader, _) = setup(tier);
        let entry = reader.get(OLD_KEY).await.unwrap();
        assert_eq!(entry.payload, stock(4));
        assert_eq!(entry.source, Provenance::LedgerDerived);
        assert_eq!(reader.stats().promotions, 1);

        // Second read is served in process.
        reader.get(OLD_KEY).await.unwrap();
        assert_eq!(reader.stats().promotions, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_purged_miss() {
        let tier = MemoryTier::new();
        let (cache, _) = setup(tier.clone());
        let storage_key = cache.storage_key(OLD_KEY);
        tier.insert_raw(
            storage_key.clone(),
            json!({
                "timestamp": start().timestamp_millis(),
                "version": 99,
                "data": {"kind": "list", "value": []},
                "source": "ledgerDerived"
            })
            .to_string(),
        );

        assert!(cache.get(OLD_KEY).await.is_none());
        assert!(tier.get_raw(&storage_key).is_none());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_purged_miss() {
        let tier = MemoryTier::new();
        let (cache, _) = setup(tier.clone());
        let storage_key = cache.storage_key(OLD_KEY);
        tier.insert_raw(storage_key.clone(), "{not json");

        assert!(cache.get(OLD_KEY).await.is_none());
        assert!(tier.get_raw(&storage_key).is_none());
    }

    #[tokio::test]
    async fn test_partial_flush_isolation() {
        let tier = MemoryTier::with_quota(2_000);
        let (cache, _) = setup(tier.clone());

        let big = CachePayload::List(vec![json!("x".repeat(4_000))]);
        cache.put("a:2026-10-01", stock(1), Provenance::LedgerDerived);
        cache.put("b:2026-10-01", big.clone(), Provenance::AggregateDerived);
        cache.put("c:2026-10-01", stock(3), Provenance::LedgerDerived);

        let report = cache.flush_dirty().await;
        assert_eq!(
            report.written,
            vec!["a:2026-10-01".to_string(), "c:2026-10-01".to_string()]
        );
        assert_eq!(report.failed, vec!["b:2026-10-01".to_string()]);

        assert!(tier.get_raw(&cache.storage_key("a:2026-10-01")).is_some());
        assert!(tier.get_raw(&cache.storage_key("c:2026-10-01")).is_some());
        assert!(tier.get_raw(&cache.storage_key("b:2026-10-01")).is_none());

        // Still served from memory, and not retried on the next cycle.
        assert_eq!(cache.get("b:2026-10-01").await.unwrap().payload, big);
        assert_eq!(cache.flush_dirty().await, FlushReport::default());
    }

    #[tokio::test]
    async fn test_quota_error_triggers_one_eviction_pass() {
        let tier = MemoryTier::with_quota(1_500);
        let (cache, clock) = setup(tier.clone());

        cache.put("old:2026-10-01", stock(1), Provenance::LedgerDerived);
        cache.flush_dirty().await;

        clock.advance(ChronoDuration::hours(2));
        let big = CachePayload::List(vec![json!("x".repeat(3_000))]);
        cache.put("big1:2026-10-02", big.clone(), Provenance::AggregateDerived);
        cache.put("big2:2026-10-02", big, Provenance::AggregateDerived);

        let report = cache.flush_dirty().await;
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.evicted, 2); // "old" in memory and on disk
        assert!(tier.keys().await.unwrap().is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_sweep_ignores_key_class() {
        let tier = MemoryTier::new();
        let (cache, clock) = setup(tier.clone());
        cache.put(TODAY_KEY, stock(6), Provenance::LedgerDerived);
        cache.put(OLD_KEY, stock(4), Provenance::LedgerDerived);
        cache.flush_dirty().await;

        clock.advance(ChronoDuration::minutes(59));
        assert_eq!(cache.sweep().await, 0);

        clock.advance(ChronoDuration::minutes(1));
        assert_eq!(cache.sweep().await, 4);
        assert!(cache.keys().is_empty());
        assert!(tier.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_levels() {
        let tier = MemoryTier::new();
        let (cache, _) = setup(tier.clone());
        cache.put(OLD_KEY, stock(4), Provenance::LedgerDerived);
        cache.put(TODAY_KEY, stock(6), Provenance::LedgerDerived);
        cache.flush_dirty().await;
        tier.insert_raw("foreign.key", "keep me");

        cache.invalidate(OLD_KEY).await;
        assert!(cache.get(OLD_KEY).await.is_none());
        assert!(cache.get(TODAY_KEY).await.is_some());

        cache.invalidate_all().await;
        assert!(cache.keys().is_empty());
        assert_eq!(tier.keys().await.unwrap(), vec!["foreign.key".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_during_write_is_not_undone() {
        let tier = GatedTier::default();
        let clock = ManualClock::new(start());
        let cache = CacheManager::new(tier.clone(), CacheOptions::default(), Arc::new(clock));
        cache.put(TODAY_KEY, stock(6), Provenance::LedgerDerived);

        let flushing = tokio::spawn({
            let cache = cache.clone();
            async move { cache.flush_dirty().await }
        });
        tier.entered.notified().await;
        cache.invalidate(TODAY_KEY).await;
        tier.open();
        let report = flushing.await.unwrap();

        assert!(report.written.is_empty());
        assert!(tier.inner.get_raw(&cache.storage_key(TODAY_KEY)).is_none());
        assert!(cache.get(TODAY_KEY).await.is_none());
        assert_eq!(cache.stats().promotions, 0);
    }

    #[tokio::test]
    async fn test_entry_replaced_during_write_is_flushed_again() {
        let tier = GatedTier::default();
        let clock = ManualClock::new(start());
        let cache = CacheManager::new(tier.clone(), CacheOptions::default(), Arc::new(clock.clone()));
        cache.put(OLD_KEY, stock(4), Provenance::LedgerDerived);
        let written = cache.get(OLD_KEY).await.unwrap();

        let flushing = tokio::spawn({
            let cache = cache.clone();
            async move { cache.flush_dirty().await }
        });
        tier.entered.notified().await;
        // A sibling's newer copy lands without marking the key dirty.
        clock.advance(ChronoDuration::seconds(1));
        let mut newer = written;
        newer.payload = stock(3);
        newer.written_at = cache.now();
        assert!(cache.accept_if_newer(newer));
        tier.open();
        assert!(flushing.await.unwrap().written.is_empty());

        tier.open();
        assert_eq!(cache.flush_dirty().await.written, vec![OLD_KEY.to_string()]);
        let raw = tier.inner.get_raw(&cache.storage_key(OLD_KEY)).unwrap();
        assert_eq!(cache.decode(OLD_KEY, &raw).unwrap().payload, stock(3));
    }

    #[tokio::test]
    async fn test_category_merge_is_idempotent_and_tracks_origin() {
        let (cache, _) = setup(MemoryTier::new());
        let key = "categories:2026-10-16";
        let mut doc = CategoryDocument::new();
        doc.insert("ring".to_string(), node(3, 5));

        // Nothing loaded yet: one document alone does not make an entry.
        assert!(!cache.merge_category_document(key, "gold", &doc, MergeOrigin::RemoteFeed));
        assert!(!cache.remove_category(key, "gold", MergeOrigin::RemoteFeed));
        assert!(cache.keys().is_empty());

        // An empty collection listing does.
        assert!(!cache.merge_category_map(key, &CategoryMap::new(), MergeOrigin::SiblingTab));
        assert_eq!(cache.keys(), vec![key.to_string()]);

        assert!(cache.merge_category_document(key, "gold", &doc, MergeOrigin::SiblingTab));
        assert!(!cache.merge_category_document(key, "gold", &doc, MergeOrigin::SiblingTab));
        assert_eq!(cache.flush_dirty().await, FlushReport::default());

        let mut older = CategoryDocument::new();
        older.insert("ring".to_string(), node(9, 1));
        assert!(!cache.merge_category_document(key, "gold", &older, MergeOrigin::RemoteFeed));

        let mut newer = CategoryDocument::new();
        newer.insert("ring".to_string(), node(1, 9));
        assert!(cache.merge_category_document(key, "gold", &newer, MergeOrigin::RemoteFeed));
        assert_eq!(cache.flush_dirty().await.written, vec![key.to_string()]);

        let entry = cache.get(key).await.unwrap();
        let cats = entry.payload.as_categories().unwrap();
        assert_eq!(cats["gold"]["ring"].quantity, 1);

        assert!(cache.remove_category(key, "gold", MergeOrigin::RemoteFeed));
        assert!(!cache.remove_category(key, "gold", MergeOrigin::RemoteFeed));
    }

    #[tokio::test]
    async fn test_accept_if_newer() {
        let (cache, clock) = setup(MemoryTier::new());
        cache.put(OLD_KEY, stock(4), Provenance::LedgerDerived);
        let current = cache.get(OLD_KEY).await.unwrap();

        let mut same_time = current.clone();
        same_time.payload = stock(5);
        assert!(!cache.accept_if_newer(same_time));

        clock.advance(ChronoDuration::seconds(1));
        let mut newer = current;
        newer.payload = stock(5);
        newer.written_at = cache.now();
        assert!(cache.accept_if_newer(newer));
        assert_eq!(cache.get(OLD_KEY).await.unwrap().payload, stock(5));
    }

    #[tokio::test]
    async fn test_peek_stale_returns_expired_entry() {
        let (cache, clock) = setup(MemoryTier::new());
        cache.put(TODAY_KEY, stock(6), Provenance::LedgerDerived);
        clock.advance(ChronoDuration::minutes(10));

        assert!(cache.get(TODAY_KEY).await.is_none());
        assert_eq!(cache.peek_stale(TODAY_KEY).await.unwrap().payload, stock(6));
    }
}
