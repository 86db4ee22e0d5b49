//! # Cross-Tab Synchronizer
//!
//! Keeps sibling sessions (browser tabs, or several engines over one
//! persistent tier) converged. Each session publishes the JSON it persisted
//! under a storage key; the others parse it and merge it into their own
//! in-process cache with the same last-write-wins rule the change feed
//! uses.
//!
//! ```text
//!  Tab A: flush ──► tier.write(k, json) ──► PubSubPort.publish(k, json)
//!                                                   │
//!                     ┌─────────────────────────────┘
//!                     ▼
//!  Tab B: CrossTabSynchronizer ── parse ── version ok? ── merge ── render(k)
//!                                   │           │
//!                                   └─ bad ─────┴──► ignore
//! ```
//!
//! A removal drops the key from the in-process map so the next read goes
//! back to the store. Nothing here can fail the caller: malformed payloads,
//! foreign keys and other schema versions are dropped.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, MergeOrigin};
use crate::persist::PersistentTier;
use crate::render::RenderSink;

/// A storage change seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    /// Session that made the change.
    pub origin: String,
    /// Storage key, including the cache prefix.
    pub key: String,
    /// New value; `None` when the key was removed.
    pub value: Option<String>,
}

/// Storage-change notifications between sessions.
pub trait PubSubPort: Send + Sync {
    /// Announces that `key` now holds `value` (`None` = removed).
    fn publish(&self, key: &str, value: Option<&str>);

    /// Receives every change published on the bus, own changes included.
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;

    /// Identity of this session on the bus.
    fn origin(&self) -> &str;
}

// =============================================================================
// Local Bus
// =============================================================================

/// An in-process bus shared by several sessions.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<RemoteChange>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        LocalBus { tx }
    }

    /// A new session on this bus with its own origin id.
    pub fn endpoint(&self) -> BusEndpoint {
        BusEndpoint {
            tx: self.tx.clone(),
            origin: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One session's view of a [`LocalBus`].
#[derive(Debug, Clone)]
pub struct BusEndpoint {
    tx: broadcast::Sender<RemoteChange>,
    origin: String,
}

impl PubSubPort for BusEndpoint {
    fn publish(&self, key: &str, value: Option<&str>) {
        // No receivers is fine: there is no sibling to notify.
        let _ = self.tx.send(RemoteChange {
            origin: self.origin.clone(),
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.tx.subscribe()
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

pub struct CrossTabSynchronizer<P> {
    cache: CacheManager<P>,
    port: Arc<dyn PubSubPort>,
    render: Arc<dyn RenderSink>,
}

/// Handle for a running synchronizer.
#[derive(Debug)]
pub struct CrossTabHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CrossTabHandle {
    /// Stops listening and waits for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl<P: PersistentTier> CrossTabSynchronizer<P> {
    pub fn new(
        cache: CacheManager<P>,
        port: Arc<dyn PubSubPort>,
        render: Arc<dyn RenderSink>,
    ) -> Self {
        CrossTabSynchronizer {
            cache,
            port,
            render,
        }
    }

    /// Applies one storage change. Returns whether the cache changed.
    pub fn handle_change(&self, change: &RemoteChange) -> bool {
        if change.origin == self.port.origin() {
            return false;
        }
        let Some(key) = self.cache.cache_key(&change.key) else {
            return false;
        };
        let Some(raw) = change.value.as_deref() else {
            // The sibling already purged the shared tier.
            let removed = self.cache.forget(key);
            if removed {
                debug!(key = %key, "Cross-tab removal applied");
                self.render.render(key);
            }
            return removed;
        };
        let Some(entry) = self.cache.decode(key, raw) else {
            debug!(key = %key, "Ignoring unusable cross-tab payload");
            return false;
        };

        let changed = match entry.payload.as_categories() {
            Some(categories) => {
                self.cache
                    .merge_category_map(key, categories, MergeOrigin::SiblingTab)
            }
            None => self.cache.accept_if_newer(entry),
        };

        if changed {
            debug!(key = %key, "Cross-tab change merged");
            self.render.render(key);
        }
        changed
    }

    /// Starts listening on the port.
    pub fn start(self) -> CrossTabHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut rx = self.port.subscribe();

        let task = tokio::spawn(async move {
            info!(origin = %self.port.origin(), "Cross-tab synchronizer started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = rx.recv() => match received {
                        Ok(change) => {
                            self.handle_change(&change);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Cross-tab listener lagged; some changes were missed");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("Cross-tab synchronizer stopped");
        });

        CrossTabHandle { shutdown_tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOptions, FlushReport};
    use crate::persist::MemoryTier;
    use crate::render::{ChannelRender, RenderEvent};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use gemstock_core::{
        CacheEntry, CachePayload, CategoryDocument, CategoryMap, ItemTypeNode, ManualClock,
        PersistedEntry, Provenance,
    };

    const KEY: &str = "categories:2026-10-16";

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn session(bus: &LocalBus) -> (CacheManager<MemoryTier>, Arc<BusEndpoint>) {
        let clock = ManualClock::new(t(0));
        let cache = CacheManager::new(MemoryTier::new(), CacheOptions::default(), Arc::new(clock));
        let endpoint = Arc::new(bus.endpoint());
        cache.attach_pubsub(endpoint.clone());
        (cache, endpoint)
    }

    fn categories(quantity: i64, minute: i64) -> CategoryMap {
        let mut node = ItemTypeNode::new(t(minute));
        node.quantity = quantity;
        let mut doc = CategoryDocument::new();
        doc.insert("ring".to_string(), node);
        let mut map = CategoryMap::new();
        map.insert("gold".to_string(), doc);
        map
    }

    fn payload(map: CategoryMap, version: u32) -> String {
        let entry = CacheEntry {
            key: KEY.to_string(),
            payload: CachePayload::Categories(map),
            source: Provenance::AggregateDerived,
            version,
            written_at: t(0),
        };
        serde_json::to_string(&PersistedEntry::from_entry(&entry)).unwrap()
    }

    fn change(cache: &CacheManager<MemoryTier>, value: Option<String>) -> RemoteChange {
        RemoteChange {
            origin: "other-tab".to_string(),
            key: cache.storage_key(KEY),
            value,
        }
    }

    #[tokio::test]
    async fn test_merges_sibling_snapshot_and_renders() {
        let bus = LocalBus::default();
        let (cache, endpoint) = session(&bus);
        let (render, mut events) = ChannelRender::new();
        let sync = CrossTabSynchronizer::new(cache.clone(), endpoint, Arc::new(render));

        assert!(sync.handle_change(&change(&cache, Some(payload(categories(4, 5), 1)))));
        assert_eq!(events.try_recv().unwrap(), RenderEvent::Render(KEY.to_string()));

        // Same snapshot again: nothing changes, nothing renders.
        assert!(!sync.handle_change(&change(&cache, Some(payload(categories(4, 5), 1)))));
        assert!(events.try_recv().is_err());

        // Older node loses.
        assert!(!sync.handle_change(&change(&cache, Some(payload(categories(9, 1), 1)))));
        let entry = cache.get(KEY).await.unwrap();
        assert_eq!(entry.payload.as_categories().unwrap()["gold"]["ring"].quantity, 4);

        // Sibling merges are not written back.
        assert!(cache.flush_dirty().await.written.is_empty());
    }

    #[tokio::test]
    async fn test_ignores_bad_and_foreign_events() {
        let bus = LocalBus::default();
        let (cache, endpoint) = session(&bus);
        let sync = CrossTabSynchronizer::new(cache.clone(), endpoint.clone(), Arc::new(crate::render::NoOpRender));

        assert!(!sync.handle_change(&change(&cache, Some("{\"timestamp\": 1, \"da".into()))));
        assert!(!sync.handle_change(&change(&cache, Some(payload(categories(1, 1), 7)))));
        assert!(!sync.handle_change(&change(&cache, None)));
        assert!(!sync.handle_change(&RemoteChange {
            origin: "other-tab".into(),
            key: "someone.else:2026-10-16".into(),
            value: Some(payload(categories(1, 1), 1)),
        }));
        let mut own = change(&cache, Some(payload(categories(1, 1), 1)));
        own.origin = endpoint.origin().to_string();
        assert!(!sync.handle_change(&own));

        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn test_flush_in_one_session_reaches_the_other() {
        let bus = LocalBus::default();
        let (writer_cache, _) = session(&bus);
        let (reader_cache, reader_endpoint) = session(&bus);
        let (render, mut events) = ChannelRender::new();
        let handle = CrossTabSynchronizer::new(
            reader_cache.clone(),
            reader_endpoint,
            Arc::new(render),
        )
        .start();

        writer_cache.merge_category_map(KEY, &categories(2, 3), MergeOrigin::RemoteFeed);
        writer_cache.flush_dirty().await;

        assert_eq!(events.recv().await, Some(RenderEvent::Render(KEY.to_string())));
        let entry = reader_cache.get(KEY).await.unwrap();
        assert_eq!(entry.payload.as_categories().unwrap()["gold"]["ring"].quantity, 2);

        // An invalidation in the writer drops the reader's copy too.
        writer_cache.invalidate(KEY).await;
        assert_eq!(events.recv().await, Some(RenderEvent::Render(KEY.to_string())));
        assert!(reader_cache.keys().is_empty());
        assert!(reader_cache.get(KEY).await.is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_removal_forgets_local_entry_without_echo() {
        let bus = LocalBus::default();
        let (cache, endpoint) = session(&bus);
        let mut echoes = bus.endpoint().subscribe();
        let (render, mut events) = ChannelRender::new();
        let sync = CrossTabSynchronizer::new(cache.clone(), endpoint, Arc::new(render));

        cache.merge_category_map(KEY, &categories(4, 5), MergeOrigin::RemoteFeed);
        assert_eq!(cache.keys(), vec![KEY.to_string()]);

        assert!(sync.handle_change(&change(&cache, None)));
        assert_eq!(events.try_recv().unwrap(), RenderEvent::Render(KEY.to_string()));
        assert!(cache.keys().is_empty());

        // The pending write went with it, and nothing was re-published.
        assert_eq!(cache.flush_dirty().await, FlushReport::default());
        assert!(echoes.try_recv().is_err());

        // Removing what is not held changes nothing.
        assert!(!sync.handle_change(&change(&cache, None)));
        assert!(events.try_recv().is_err());
    }
}
