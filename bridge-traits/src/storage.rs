//! Table Storage Abstraction
//!
//! Provides the platform-agnostic, table-oriented key-value store the sync
//! engine persists into. Rows are JSON documents keyed by `(table, id)`.
//! Entity tables, the operation queue and the delta tokens are all logical
//! tables inside one physical store.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Default page size used by [`TableStore::scan_all`].
const SCAN_ALL_PAGE: usize = 256;

/// A stored row as returned by [`TableStore::scan`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub data: Value,
}

/// Table-oriented transactional key-value store
///
/// Abstracts platform storage drivers:
/// - Desktop: SQLite via `sqlx`
/// - iOS/Android: SQLite bindings owned by the host
/// - Web: IndexedDB
///
/// Single-row writes through [`put`](TableStore::put) and
/// [`delete`](TableStore::delete) are atomic. Multi-row writes must go
/// through a [`StoreTransaction`].
///
/// Implementations backed by a single connection must not be read through
/// the store while a transaction is open on the same task; read through the
/// transaction instead.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::TableStore;
///
/// async fn save_pair(store: &dyn TableStore) -> Result<()> {
///     let mut tx = store.begin_transaction().await?;
///     tx.put("todoitem", "a", &json!({ "id": "a" })).await?;
///     tx.put("__deltaTokens", "dt.todoitem.all", &json!({ "value": 0 })).await?;
///     tx.commit().await
/// }
/// ```
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Fetch a single row
    ///
    /// Returns `Ok(None)` if the row doesn't exist.
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Read up to `limit` rows ordered by id, strictly after `after_id`
    async fn scan(&self, table: &str, after_id: Option<&str>, limit: usize)
        -> Result<Vec<StoredRow>>;

    /// Count rows in a table
    async fn count(&self, table: &str) -> Result<u64>;

    /// Begin a transaction for atomic multi-row updates
    ///
    /// Nothing written through the transaction is visible to other readers
    /// until [`StoreTransaction::commit`] succeeds.
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Insert or replace a single row
    async fn put(&self, table: &str, id: &str, value: &Value) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        tx.put(table, id, value).await?;
        tx.commit().await
    }

    /// Delete a single row (no-op if absent)
    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        tx.delete(table, id).await?;
        tx.commit().await
    }

    /// Read a whole table ordered by id
    async fn scan_all(&self, table: &str) -> Result<Vec<StoredRow>> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.scan(table, cursor.as_deref(), SCAN_ALL_PAGE).await?;
            let done = page.len() < SCAN_ALL_PAGE;
            cursor = page.last().map(|row| row.id.clone());
            rows.extend(page);

            if done {
                return Ok(rows);
            }
        }
    }
}

/// Transaction for atomic multi-row updates
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a row, observing writes already made in this transaction
    async fn get(&mut self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Read all rows of a table inside the transaction, ordered by id
    async fn scan_all(&mut self, table: &str) -> Result<Vec<StoredRow>>;

    /// Insert or replace a row within the transaction
    async fn put(&mut self, table: &str, id: &str, value: &Value) -> Result<()>;

    /// Delete a row within the transaction
    async fn delete(&mut self, table: &str, id: &str) -> Result<()>;

    /// Delete every row of a table within the transaction
    async fn clear(&mut self, table: &str) -> Result<()>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}
