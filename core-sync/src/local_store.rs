//! # Local Store
//!
//! Durable storage for synced entities on top of a host [`TableStore`].
//!
//! ## Overview
//!
//! Entity rows, pending operations and delta tokens are logical tables in
//! one physical store. All writers in a context go through
//! [`LocalStore::begin`], which pairs a store transaction with the context's
//! write lock, so a read-modify-write such as queue collapsing cannot
//! interleave with another writer. Reads never take the lock.
//!
//! ## Usage
//!
//! ```ignore
//! let mut tx = store.begin().await?;
//! tx.stage_upsert("todoitem", "a", &item).await?;
//! tx.stage_upsert("__deltaTokens", "dt.todoitem.all", &token).await?;
//! tx.commit().await?;
//! ```
//!
//! Dropping a [`SyncTransaction`] without committing rolls it back.

use bridge_traits::storage::{StoreTransaction, StoredRow, TableStore};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::entity::Entity;
use crate::error::Result;
use crate::schema::SchemaRegistry;

/// Rows fetched per round trip by [`LocalStore::query`]
const QUERY_PAGE_SIZE: usize = 100;

/// Entity storage shared by the queue, the delta tracker and the context
#[derive(Clone)]
pub struct LocalStore {
    store: Arc<dyn TableStore>,
    registry: Arc<SchemaRegistry>,
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(store: Arc<dyn TableStore>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            registry,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Open a write transaction, waiting for any other writer to finish
    pub async fn begin(&self) -> Result<SyncTransaction> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let inner = self.store.begin_transaction().await?;
        Ok(SyncTransaction {
            inner,
            _write_guard: guard,
        })
    }

    /// Insert or replace an entity of a registered table
    pub async fn upsert(&self, table: &str, entity: &Entity) -> Result<()> {
        let id = self.registry.get(table)?.require_id(entity)?;
        let mut tx = self.begin().await?;
        tx.stage_upsert(table, &id, entity).await?;
        tx.commit().await
    }

    /// Remove an entity row. Missing rows are not an error.
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.registry.get(table)?;
        let mut tx = self.begin().await?;
        tx.stage_delete(table, id).await?;
        tx.commit().await
    }

    /// Raw row read; soft-deleted rows are returned as stored
    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        Ok(self.store.get(table, id).await?)
    }

    pub async fn count(&self, table: &str) -> Result<u64> {
        Ok(self.store.count(table).await?)
    }

    /// Remove every row of a table
    pub async fn clear(&self, table: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        tx.clear(table).await?;
        tx.commit().await
    }

    pub(crate) async fn scan(
        &self,
        table: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        Ok(self.store.scan(table, after_id, limit).await?)
    }

    pub(crate) async fn scan_all(&self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(self.store.scan_all(table).await?)
    }

    /// Lazily stream the rows of `table` accepted by `predicate`, in id order
    ///
    /// The stream pages through the store on demand and ends after the last
    /// row. Each call starts from the beginning and observes current state.
    pub fn query<'a, P>(&self, table: &'a str, predicate: P) -> BoxStream<'a, Result<Entity>>
    where
        P: Fn(&Entity) -> bool + Send + 'a,
    {
        let store = Arc::clone(&self.store);

        stream::try_unfold((QueryCursor::default(), predicate), move |state| {
            next_match(Arc::clone(&store), table, state)
        })
        .boxed()
    }
}

/// Advance `cursor` to the next row accepted by `predicate`, loading pages as needed
async fn next_match<P>(
    store: Arc<dyn TableStore>,
    table: &str,
    (mut cursor, predicate): (QueryCursor, P),
) -> Result<Option<(Entity, (QueryCursor, P))>>
where
    P: Fn(&Entity) -> bool,
{
    loop {
        if let Some(row) = cursor.buffer.pop_front() {
            if predicate(&row.data) {
                return Ok(Some((row.data, (cursor, predicate))));
            }
            continue;
        }

        if cursor.exhausted {
            return Ok(None);
        }

        let rows = store
            .scan(table, cursor.after.as_deref(), QUERY_PAGE_SIZE)
            .await?;
        debug!(table, rows = rows.len(), "Query page loaded");

        cursor.exhausted = rows.len() < QUERY_PAGE_SIZE;
        if let Some(last) = rows.last() {
            cursor.after = Some(last.id.clone());
        }
        cursor.buffer.extend(rows);
    }
}

#[derive(Default)]
struct QueryCursor {
    after: Option<String>,
    buffer: VecDeque<StoredRow>,
    exhausted: bool,
}

/// Write transaction holding the context's write lock
pub struct SyncTransaction {
    inner: Box<dyn StoreTransaction>,
    _write_guard: OwnedMutexGuard<()>,
}

impl SyncTransaction {
    /// Read a row, observing this transaction's own writes
    pub async fn get(&mut self, table: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.inner.get(table, id).await?)
    }

    pub async fn scan_all(&mut self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(self.inner.scan_all(table).await?)
    }

    pub async fn stage_upsert(&mut self, table: &str, id: &str, value: &Value) -> Result<()> {
        Ok(self.inner.put(table, id, value).await?)
    }

    pub async fn stage_delete(&mut self, table: &str, id: &str) -> Result<()> {
        Ok(self.inner.delete(table, id).await?)
    }

    pub async fn clear(&mut self, table: &str) -> Result<()> {
        Ok(self.inner.clear(table).await?)
    }

    pub async fn commit(self) -> Result<()> {
        Ok(self.inner.commit().await?)
    }

    pub async fn rollback(self) -> Result<()> {
        Ok(self.inner.rollback().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDescriptor;
    use crate::SyncError;
    use bridge_desktop::SqliteTableStore;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn local_store() -> LocalStore {
        let store = SqliteTableStore::in_memory().await.unwrap();
        let registry = SchemaRegistry::new()
            .with(SchemaDescriptor::new("todoitem").unwrap())
            .unwrap();
        LocalStore::new(Arc::new(store), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trip() {
        let store = local_store().await;
        let item = json!({ "id": "a", "title": "milk", "complete": false });

        store.upsert("todoitem", &item).await.unwrap();

        assert_eq!(store.get("todoitem", "a").await.unwrap(), Some(item));
        assert_eq!(store.count("todoitem").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_table_and_bad_ids() {
        let store = local_store().await;

        assert!(matches!(
            store.upsert("category", &json!({ "id": "a" })).await,
            Err(SyncError::UnknownTable(_))
        ));
        assert!(matches!(
            store.upsert("todoitem", &json!({ "title": "no id" })).await,
            Err(SyncError::InvalidEntity { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = local_store().await;
        for id in ["a", "b", "c"] {
            store.upsert("todoitem", &json!({ "id": id })).await.unwrap();
        }

        store.delete("todoitem", "b").await.unwrap();
        store.delete("todoitem", "missing").await.unwrap();
        assert_eq!(store.count("todoitem").await.unwrap(), 2);

        store.clear("todoitem").await.unwrap();
        assert_eq!(store.count("todoitem").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_pages_lazily_and_filters() {
        let store = local_store().await;
        for n in 0..250 {
            store
                .upsert(
                    "todoitem",
                    &json!({ "id": format!("item{:03}", n), "complete": n % 2 == 0 }),
                )
                .await
                .unwrap();
        }

        let complete: Vec<Entity> = store
            .query("todoitem", |item| item["complete"] == json!(true))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(complete.len(), 125);
        assert_eq!(complete[0]["id"], "item000");
        assert_eq!(complete[124]["id"], "item248");

        let first_two: Vec<Entity> = store
            .query("todoitem", |_| true)
            .take(2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first_two.len(), 2);
    }

    #[tokio::test]
    async fn test_query_is_restartable() {
        let store = local_store().await;
        store.upsert("todoitem", &json!({ "id": "a" })).await.unwrap();

        let first: Vec<Entity> = store.query("todoitem", |_| true).try_collect().await.unwrap();
        store.upsert("todoitem", &json!({ "id": "b" })).await.unwrap();
        let second: Vec<Entity> = store.query("todoitem", |_| true).try_collect().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = local_store().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.stage_upsert("todoitem", "a", &json!({ "id": "a" }))
                .await
                .unwrap();
            assert!(tx.get("todoitem", "a").await.unwrap().is_some());
        }

        assert_eq!(store.get("todoitem", "a").await.unwrap(), None);

        let mut tx = store.begin().await.unwrap();
        tx.stage_upsert("todoitem", "b", &json!({ "id": "b" }))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.get("todoitem", "b").await.unwrap().is_some());
    }
}
