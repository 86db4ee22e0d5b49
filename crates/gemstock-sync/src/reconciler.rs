//! # Change-Feed Reconciler
//!
//! Subscribes to the aggregate category collection and folds every change
//! batch into today's categories cache entry.
//!
//! ## Lifecycle
//! ```text
//!        ┌──────────────┐   batch (pending writes) ──► ignored
//!   ┌──► │  Subscribed  │   batch (confirmed) ───────► merge (LWW) ─► render?
//!   │    └──────┬───────┘
//!   │           │ feed error / closed
//!   │           ▼
//!   │    ┌──────────────┐
//!   │    │    Stale     │   render.stale(true), cache left as is
//!   │    └──────┬───────┘
//!   │           │ after refetch_backoff
//!   │           ▼
//!   │    ┌──────────────┐
//!   └─── │  Refetching  │   list_documents ─► merge ─► render.stale(false)
//!        └──────────────┘
//! ```
//!
//! Only a complete listing (the first batch of a subscription, or a
//! refetch) may create the day's entry. Deltas are folded into an entry
//! that already exists and are otherwise left for the next full read.
//!
//! The subscription lives until [`ReconcilerHandle::shutdown`] is called
//! or the handle is dropped; either way the feed is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use gemstock_core::ingest::category_document;
use gemstock_core::key::CacheTarget;
use gemstock_core::replay::business_date;
use gemstock_core::CategoryMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, MergeOrigin};
use crate::error::{SyncError, SyncResult};
use crate::persist::PersistentTier;
use crate::render::RenderSink;
use crate::store::{ChangeBatch, ChangeFeed, ChangeKind, DocumentChange, DocumentStore, FeedEvent};

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Collection holding the per-category aggregate documents.
    pub collection: String,
    /// Wait before the one-shot refetch after a feed failure.
    pub refetch_backoff: Duration,
    /// Business-day offset; decides which day's key the merges land in.
    pub offset: FixedOffset,
}

pub struct ChangeFeedReconciler<S, P> {
    store: S,
    cache: CacheManager<P>,
    render: Arc<dyn RenderSink>,
    options: ReconcilerOptions,
}

/// Handle for a running reconciler.
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Unsubscribes and waits for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

enum FeedStep {
    Batch(ChangeBatch),
    Failed(SyncError),
    Shutdown,
}

impl<S: DocumentStore, P: PersistentTier> ChangeFeedReconciler<S, P> {
    pub fn new(
        store: S,
        cache: CacheManager<P>,
        render: Arc<dyn RenderSink>,
        options: ReconcilerOptions,
    ) -> Self {
        ChangeFeedReconciler {
            store,
            cache,
            render,
            options,
        }
    }

    /// Cache key the merges currently land in.
    pub fn current_key(&self) -> String {
        let date = business_date(self.cache.now(), self.options.offset);
        CacheTarget::Categories { date }.key().into_string()
    }

    /// Merges one batch. Returns whether the cache changed; renders if so.
    pub fn apply_batch(&self, batch: &ChangeBatch) -> bool {
        if batch.has_pending_writes {
            debug!(changes = batch.changes.len(), "Ignoring local echo batch");
            return false;
        }

        let key = self.current_key();
        let mut changed = false;
        if batch.complete {
            changed = self.apply_listing(&key, batch);
        } else {
            for change in &batch.changes {
                changed |= self.apply_change(&key, change);
            }
        }

        if changed {
            self.render.render(&key);
        }
        changed
    }

    fn apply_change(&self, key: &str, change: &DocumentChange) -> bool {
        match (change.kind, &change.data) {
            (ChangeKind::Removed, _) => {
                self.cache
                    .remove_category(key, &change.doc_id, MergeOrigin::RemoteFeed)
            }
            (_, Some(data)) => match category_document(&change.doc_id, data) {
                Ok(document) => self.cache.merge_category_document(
                    key,
                    &change.doc_id,
                    &document,
                    MergeOrigin::RemoteFeed,
                ),
                Err(e) => {
                    warn!(doc_id = %change.doc_id, error = %e, "Skipping malformed category document");
                    false
                }
            },
            (_, None) => false,
        }
    }

    fn apply_listing(&self, key: &str, batch: &ChangeBatch) -> bool {
        let mut listed = CategoryMap::new();
        for change in &batch.changes {
            let Some(data) = &change.data else {
                continue;
            };
            match category_document(&change.doc_id, data) {
                Ok(document) => {
                    listed.insert(change.doc_id.clone(), document);
                }
                Err(e) => {
                    warn!(doc_id = %change.doc_id, error = %e, "Skipping malformed category document");
                }
            }
        }
        self.cache
            .merge_category_map(key, &listed, MergeOrigin::RemoteFeed)
    }

    /// One-shot full read of the collection, merged like a batch.
    pub async fn refetch(&self) -> SyncResult<bool> {
        let documents = self.store.list_documents(&self.options.collection).await?;
        let batch = ChangeBatch::snapshot(
            documents
                .into_iter()
                .map(|(id, data)| DocumentChange::upsert(ChangeKind::Modified, id, data))
                .collect(),
        );
        Ok(self.apply_batch(&batch))
    }

    /// Starts the subscription loop.
    pub fn start(self) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ReconcilerHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(collection = %self.options.collection, "Change-feed reconciler started");
        let mut stale = false;

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.store.subscribe(&self.options.collection) => result,
            };

            let failure = match subscribed {
                Ok(mut feed) => {
                    debug!(collection = %self.options.collection, "Subscribed to change feed");
                    if stale {
                        stale = false;
                        self.render.stale(false);
                    }
                    match self.drain(&mut feed, &mut shutdown).await {
                        Some(failure) => failure,
                        None => break,
                    }
                }
                Err(e) => e,
            };

            warn!(error = %failure, "Change feed failed; serving cached data");
            if !stale {
                stale = true;
                self.render.stale(true);
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.options.refetch_backoff) => {}
            }

            match self.refetch().await {
                Ok(changed) => {
                    info!(changed, "Refetched category documents after feed failure");
                    stale = false;
                    self.render.stale(false);
                }
                Err(e) => warn!(error = %e, "Refetch failed; still serving cached data"),
            }
        }

        info!("Change-feed reconciler stopped");
    }

    /// Applies batches until the feed fails (`Some`) or shutdown (`None`).
    async fn drain(
        &self,
        feed: &mut ChangeFeed,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SyncError> {
        loop {
            let step = tokio::select! {
                _ = shutdown.changed() => FeedStep::Shutdown,
                event = feed.next() => match event {
                    Some(FeedEvent::Batch(batch)) => FeedStep::Batch(batch),
                    Some(FeedEvent::Error(e)) => FeedStep::Failed(e),
                    None => FeedStep::Failed(SyncError::SubscriptionFailed("feed closed".into())),
                },
            };

            match step {
                FeedStep::Batch(batch) => {
                    self.apply_batch(&batch);
                }
                FeedStep::Failed(e) => return Some(e),
                FeedStep::Shutdown => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::persist::MemoryTier;
    use crate::render::{ChannelRender, RenderEvent};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use gemstock_core::ManualClock;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    const COLLECTION: &str = "stockCategories";
    const KEY: &str = "categories:2026-10-16";

    struct Fixture {
        clock: ManualClock,
        store: MemoryStore,
        cache: CacheManager<MemoryTier>,
        events: mpsc::UnboundedReceiver<RenderEvent>,
        reconciler: ChangeFeedReconciler<MemoryStore, MemoryTier>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap());
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let cache = CacheManager::new(
            MemoryTier::new(),
            CacheOptions::default(),
            Arc::new(clock.clone()),
        );
        let (render, events) = ChannelRender::new();
        let reconciler = ChangeFeedReconciler::new(
            store.clone(),
            cache.clone(),
            Arc::new(render),
            ReconcilerOptions {
                collection: COLLECTION.to_string(),
                refetch_backoff: Duration::from_secs(5),
                offset: FixedOffset::east_opt(7 * 3600).unwrap(),
            },
        );
        Fixture {
            clock,
            store,
            cache,
            events,
            reconciler,
        }
    }

    fn ring(quantity: i64, minute: u32) -> Value {
        json!({
            "label": "Gold",
            "ring": {
                "quantity": quantity,
                "lastUpdated": format!("2026-10-16T03:{:02}:00Z", minute),
            }
        })
    }

    async fn ring_quantity(cache: &CacheManager<MemoryTier>) -> Option<i64> {
        let entry = cache.get(KEY).await?;
        let categories = entry.payload.as_categories()?;
        Some(categories.get("gold")?.get("ring")?.quantity)
    }

    #[tokio::test]
    async fn test_pending_write_batch_is_ignored() {
        let mut f = fixture();
        let batch = ChangeBatch::pending(vec![DocumentChange::upsert(
            ChangeKind::Modified,
            "gold",
            ring(3, 5),
        )]);

        assert!(!f.reconciler.apply_batch(&batch));
        assert!(f.cache.keys().is_empty());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_confirmed_batch_merges_once() {
        let mut f = fixture();
        assert!(!f.reconciler.apply_batch(&ChangeBatch::snapshot(vec![])));
        let batch = ChangeBatch::confirmed(vec![DocumentChange::upsert(
            ChangeKind::Modified,
            "gold",
            ring(3, 5),
        )]);

        assert!(f.reconciler.apply_batch(&batch));
        assert!(!f.reconciler.apply_batch(&batch));
        assert_eq!(f.events.try_recv().unwrap(), RenderEvent::Render(KEY.to_string()));
        assert!(f.events.try_recv().is_err());
        assert_eq!(ring_quantity(&f.cache).await, Some(3));

        let removal = ChangeBatch::confirmed(vec![DocumentChange::removed("gold")]);
        assert!(f.reconciler.apply_batch(&removal));
        assert_eq!(ring_quantity(&f.cache).await, None);
    }

    #[tokio::test]
    async fn test_malformed_document_is_skipped() {
        let f = fixture();
        let batch = ChangeBatch::snapshot(vec![
            DocumentChange::upsert(ChangeKind::Added, "broken", json!([1, 2, 3])),
            DocumentChange::upsert(ChangeKind::Added, "gold", ring(2, 1)),
        ]);
        assert!(f.reconciler.apply_batch(&batch));
        assert_eq!(ring_quantity(&f.cache).await, Some(2));
    }

    #[tokio::test]
    async fn test_delta_after_rollover_does_not_create_partial_entry() {
        let mut f = fixture();
        f.store.push_remote_change(COLLECTION, "gold", ring(3, 5));
        f.store.push_remote_change(
            COLLECTION,
            "silver",
            json!({"chain": {"quantity": 8, "lastUpdated": "2026-10-16T03:00:00Z"}}),
        );
        assert!(f.reconciler.refetch().await.unwrap());
        assert_eq!(f.events.try_recv().unwrap(), RenderEvent::Render(KEY.to_string()));

        // Midnight local time: merges now target tomorrow's key.
        f.clock.advance(chrono::Duration::hours(14));
        let next_key = f.reconciler.current_key();
        assert_eq!(next_key, "categories:2026-10-17");

        let delta = ChangeBatch::confirmed(vec![DocumentChange::upsert(
            ChangeKind::Modified,
            "gold",
            ring(4, 30),
        )]);
        assert!(!f.reconciler.apply_batch(&delta));
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.cache.keys(), vec![KEY.to_string()]);

        // The next full listing brings every category in.
        f.store.push_remote_change(COLLECTION, "gold", ring(4, 30));
        assert!(f.reconciler.refetch().await.unwrap());
        let entry = f.cache.get(&next_key).await.unwrap();
        let categories = entry.payload.as_categories().unwrap();
        assert_eq!(categories["gold"]["ring"].quantity, 4);
        assert_eq!(categories["silver"]["chain"].quantity, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_feed_with_failure_and_refetch() {
        let Fixture {
            store,
            cache,
            mut events,
            reconciler,
            ..
        } = fixture();
        store.push_remote_change(COLLECTION, "gold", ring(1, 1));
        let handle = reconciler.start();

        // Initial snapshot batch.
        assert_eq!(events.recv().await, Some(RenderEvent::Render(KEY.to_string())));
        assert_eq!(ring_quantity(&cache).await, Some(1));

        // Our own write: the echo is ignored, the acknowledgement is a no-op.
        store
            .merge_update(COLLECTION, "gold", json!({"ring": {"quantity": 1, "lastUpdated": "2026-10-16T03:01:00Z"}}))
            .await
            .unwrap();

        // Feed dies; a change lands while we are disconnected.
        store.break_feeds("connection reset");
        assert_eq!(events.recv().await, Some(RenderEvent::Stale(true)));
        store.push_remote_change(COLLECTION, "gold", ring(7, 9));
        assert_eq!(ring_quantity(&cache).await, Some(1));

        // Backoff elapses, refetch brings it in.
        assert_eq!(events.recv().await, Some(RenderEvent::Render(KEY.to_string())));
        assert_eq!(events.recv().await, Some(RenderEvent::Stale(false)));
        assert_eq!(ring_quantity(&cache).await, Some(7));

        // Resubscribed: live changes flow again.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.subscriber_count(), 1);
        store.push_remote_change(COLLECTION, "gold", ring(4, 20));
        assert_eq!(events.recv().await, Some(RenderEvent::Render(KEY.to_string())));
        assert_eq!(ring_quantity(&cache).await, Some(4));

        handle.shutdown().await;
        assert_eq!(store.subscriber_count(), 0);
    }
}
