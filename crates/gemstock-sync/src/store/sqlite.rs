//! Store adapter over the local SQLite database.
//!
//! Change notifications come from writes made through this adapter; the
//! database itself has no live-query support.

use gemstock_core::{LedgerEntry, NewLedgerEntry};
use gemstock_db::Database;
use serde_json::Value;
use tracing::debug;

use super::{
    check_in_filter, snapshot_batch, ChangeBatch, ChangeFeed, ChangeKind, DocumentChange,
    DocumentStore, FeedEvent, FeedHub, LedgerQuery, LedgerStore,
};
use crate::error::SyncResult;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
    hub: FeedHub,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        SqliteStore {
            db,
            hub: FeedHub::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Errors every live feed, e.g. before the database is closed.
    pub fn close_feeds(&self, reason: &str) {
        self.hub.fail_all(reason);
    }
}

impl LedgerStore for SqliteStore {
    async fn query_ledger(&self, query: &LedgerQuery) -> SyncResult<Vec<LedgerEntry>> {
        check_in_filter(query, self.in_filter_limit())?;
        let entries = self
            .db
            .ledger()
            .list_until(query.until, query.item_codes.as_deref())
            .await?;
        Ok(entries)
    }

    async fn append(&self, entry: NewLedgerEntry) -> SyncResult<LedgerEntry> {
        Ok(self.db.ledger().append(entry).await?)
    }
}

impl DocumentStore for SqliteStore {
    async fn get_document(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        Ok(self
            .db
            .documents()
            .get(collection, id)
            .await?
            .map(|doc| doc.data))
    }

    async fn list_documents(&self, collection: &str) -> SyncResult<Vec<(String, Value)>> {
        Ok(self
            .db
            .documents()
            .list(collection)
            .await?
            .into_iter()
            .map(|doc| (doc.id, doc.data))
            .collect())
    }

    async fn merge_update(&self, collection: &str, id: &str, patch: Value) -> SyncResult<Value> {
        let documents = self.db.documents();
        let existed = documents.get(collection, id).await?.is_some();
        let stored = documents.merge_update(collection, id, &patch).await?;

        let kind = if existed {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let change = DocumentChange::upsert(kind, id, stored.data.clone());
        self.hub
            .emit(collection, ChangeBatch::pending(vec![change.clone()]));
        self.hub.emit(collection, ChangeBatch::confirmed(vec![change]));

        debug!(collection, id, "Document merge-updated");
        Ok(stored.data)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let removed = self.db.documents().delete(collection, id).await?;
        if removed {
            self.hub
                .emit(collection, ChangeBatch::confirmed(vec![DocumentChange::removed(id)]));
        }
        Ok(removed)
    }

    async fn subscribe(&self, collection: &str) -> SyncResult<ChangeFeed> {
        // Register before listing; anything written in between arrives twice
        // and merges idempotently.
        let (tx, feed) = self.hub.register(collection);
        let existing = self.list_documents(collection).await?;
        let _ = tx.send(FeedEvent::Batch(snapshot_batch(existing)));
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use gemstock_core::MovementKind;
    use gemstock_db::DbConfig;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    #[tokio::test]
    async fn test_ledger_query_filters_and_orders() {
        let store = store().await;
        let t0 = Utc.with_ymd_and_hms(2026, 10, 16, 1, 0, 0).unwrap();

        for (code, kind, qty, offset) in [
            ("X70", MovementKind::Sale, 1, 2),
            ("X70", MovementKind::InitialStock, 5, 0),
            ("Y10", MovementKind::Add, 3, 1),
            ("X70", MovementKind::Add, 9, 48),
        ] {
            store
                .append(NewLedgerEntry::new(code, kind, qty).at(t0 + Duration::hours(offset)))
                .await
                .unwrap();
        }

        let entries = store
            .query_ledger(&LedgerQuery::codes(
                t0 + Duration::hours(24),
                vec!["X70".to_string()],
            ))
            .await
            .unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.movement_kind.clone()).collect();
        assert_eq!(kinds, vec![MovementKind::InitialStock, MovementKind::Sale]);
    }

    #[tokio::test]
    async fn test_merge_update_emits_echo_and_ack() {
        let store = store().await;
        let mut feed = store.subscribe("stockCategories").await.unwrap();
        assert!(matches!(feed.next().await, Some(FeedEvent::Batch(b)) if b.changes.is_empty()));

        store
            .merge_update("stockCategories", "gold", json!({"ring": {"quantity": 1}}))
            .await
            .unwrap();

        match feed.next().await {
            Some(FeedEvent::Batch(b)) => {
                assert!(b.has_pending_writes);
                assert_eq!(b.changes[0].kind, ChangeKind::Added);
            }
            other => panic!("unexpected {:?}", other),
        }
        match feed.next().await {
            Some(FeedEvent::Batch(b)) => assert!(!b.has_pending_writes),
            other => panic!("unexpected {:?}", other),
        }

        assert!(store.delete_document("stockCategories", "gold").await.unwrap());
        match feed.next().await {
            Some(FeedEvent::Batch(b)) => assert_eq!(b.changes[0].kind, ChangeKind::Removed),
            other => panic!("unexpected {:?}", other),
        }
    }
}
