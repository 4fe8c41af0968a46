//! Table Storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{StoreTransaction, StoredRow, TableStore},
};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Row, Sqlite,
};
use std::path::PathBuf;
use tracing::{debug, error};

const CREATE_ROWS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_rows (
        table_name TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        written_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, id)
    ) WITHOUT ROWID
"#;

const UPSERT_ROW: &str = r#"
    INSERT INTO sync_rows (table_name, id, data, written_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(table_name, id) DO UPDATE SET
        data = excluded.data,
        written_at = excluded.written_at
"#;

/// SQLite-backed table store implementation
///
/// Every logical table lives in one physical `sync_rows` table keyed by
/// `(table_name, id)`, so a single SQLite transaction can span entity rows,
/// queued operations and delta tokens.
pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    /// Open (or create) a table store at the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        Self::initialize(&pool).await?;
        debug!(path = ?db_path, "Initialized table store");

        Ok(Self { pool })
    }

    /// Create an in-memory table store (for testing)
    ///
    /// The pool is pinned to one connection that never expires, because each
    /// SQLite in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        Self::initialize(&pool).await?;

        Ok(Self { pool })
    }

    /// Default database location under the user's data directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("tablesync").join("tablesync.db"))
    }

    async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(CREATE_ROWS_TABLE)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to create table: {}", e)))?;

        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn encode(value: &Value) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to encode row: {}", e)))
    }

    fn decode(table: &str, id: &str, data: &str) -> Result<Value> {
        serde_json::from_str(data).map_err(|e| {
            error!(table = table, id = id, error = %e, "Corrupt row");
            BridgeError::DatabaseError(format!("Corrupt row {}/{}: {}", table, id, e))
        })
    }
}

#[async_trait]
impl TableStore for SqliteTableStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT data FROM sync_rows WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to get row: {}", e)))?;

        match row {
            Some(row) => {
                let data: String = row.get(0);
                Ok(Some(Self::decode(table, id, &data)?))
            }
            None => Ok(None),
        }
    }

    async fn scan(
        &self,
        table: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, data FROM sync_rows
            WHERE table_name = ?1 AND (?2 IS NULL OR id > ?2)
            ORDER BY id
            LIMIT ?3
            "#,
        )
        .bind(table)
        .bind(after_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to scan table: {}", e)))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get(0);
                let data: String = row.get(1);
                let data = Self::decode(table, &id, &data)?;
                Ok(StoredRow { id, data })
            })
            .collect()
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_rows WHERE table_name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to count rows: {}", e)))?;

        Ok(count.max(0) as u64)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| {
            BridgeError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        Ok(Box::new(SqliteStoreTransaction { tx: Some(tx) }))
    }
}

/// SQLite table store transaction
struct SqliteStoreTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteStoreTransaction {
    fn open(&mut self) -> Result<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or(BridgeError::TransactionClosed)
    }
}

#[async_trait]
impl StoreTransaction for SqliteStoreTransaction {
    async fn get(&mut self, table: &str, id: &str) -> Result<Option<Value>> {
        let tx = self.open()?;

        let row = sqlx::query("SELECT data FROM sync_rows WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to get row: {}", e)))?;

        match row {
            Some(row) => {
                let data: String = row.get(0);
                Ok(Some(SqliteTableStore::decode(table, id, &data)?))
            }
            None => Ok(None),
        }
    }

    async fn scan_all(&mut self, table: &str) -> Result<Vec<StoredRow>> {
        let tx = self.open()?;

        let rows = sqlx::query("SELECT id, data FROM sync_rows WHERE table_name = ? ORDER BY id")
            .bind(table)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to scan table: {}", e)))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get(0);
                let data: String = row.get(1);
                let data = SqliteTableStore::decode(table, &id, &data)?;
                Ok(StoredRow { id, data })
            })
            .collect()
    }

    async fn put(&mut self, table: &str, id: &str, value: &Value) -> Result<()> {
        let data = SqliteTableStore::encode(value)?;
        let tx = self.open()?;

        sqlx::query(UPSERT_ROW)
            .bind(table)
            .bind(id)
            .bind(data)
            .bind(SqliteTableStore::now())
            .execute(&mut **tx)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to write row: {}", e)))?;

        Ok(())
    }

    async fn delete(&mut self, table: &str, id: &str) -> Result<()> {
        let tx = self.open()?;

        sqlx::query("DELETE FROM sync_rows WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to delete row: {}", e)))?;

        Ok(())
    }

    async fn clear(&mut self, table: &str) -> Result<()> {
        let tx = self.open()?;

        let result = sqlx::query("DELETE FROM sync_rows WHERE table_name = ?")
            .bind(table)
            .execute(&mut **tx)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to clear table: {}", e)))?;

        debug!(table = table, rows = result.rows_affected(), "Cleared table");
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().ok_or(BridgeError::TransactionClosed)?;

        tx.commit()
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to commit: {}", e)))?;

        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().ok_or(BridgeError::TransactionClosed)?;

        tx.rollback()
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to rollback: {}", e)))?;

        debug!("Rolled back transaction");
        Ok(())
    }
}
