//! # Operation Queue
//!
//! Durable, ordered log of local mutations waiting to be pushed.
//!
//! ## Overview
//!
//! Every local insert, update or delete appends a [`PendingOperation`] to the
//! `__operations` table, keyed by a zero-padded sequence number so a store
//! scan returns operations in push order. The sequence counter lives in the
//! `__config` table and only moves forward.
//!
//! ## Collapsing
//!
//! At most one operation exists per `(table, item)`. A new mutation for an
//! item with a pending operation is merged into it by [`collapse`]:
//!
//! | existing | new | result |
//! |----------|-----|--------|
//! | Insert | Update | Insert with the newest snapshot |
//! | Insert | Delete | operation removed |
//! | Update | Update | Update with the newest snapshot |
//! | Update | Delete | Delete |
//! | Delete | anything | rejected |
//! | Insert or Update | Insert | rejected |
//!
//! A merged operation keeps its original sequence number, so its position
//! relative to other items does not change.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = OperationQueue::new(local_store, Arc::new(SystemClock));
//! queue.enqueue(NewOperation::insert("todoitem", "a", json!({ "id": "a" }))).await?;
//! while let Some(op) = queue.peek().await? {
//!     // push op, then
//!     queue.remove(op.sequence).await?;
//! }
//! ```

use bridge_traits::storage::StoredRow;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::local_store::{LocalStore, SyncTransaction};

/// Logical table holding pending operations
pub const OPERATIONS_TABLE: &str = "__operations";

/// Logical table holding engine counters
pub const CONFIG_TABLE: &str = "__config";

const SEQUENCE_KEY: &str = "operations.sequence";

// ============================================================================
// Operation types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push state of a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Never sent, or changed locally since the last attempt
    #[default]
    Pending,
    /// Sent at least once, stopped by a transient or authentication failure
    Attempted,
    /// Left in place after an unresolved conflict
    Failed,
}

/// A mutation about to enter the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub table: String,
    pub item_id: String,
    pub kind: OperationKind,
    pub snapshot: Option<Value>,
    /// Server version of the item as known locally
    pub version: Option<String>,
}

impl NewOperation {
    pub fn insert(table: impl Into<String>, item_id: impl Into<String>, snapshot: Value) -> Self {
        Self {
            table: table.into(),
            item_id: item_id.into(),
            kind: OperationKind::Insert,
            snapshot: Some(snapshot),
            version: None,
        }
    }

    pub fn update(
        table: impl Into<String>,
        item_id: impl Into<String>,
        snapshot: Value,
        version: Option<String>,
    ) -> Self {
        Self {
            table: table.into(),
            item_id: item_id.into(),
            kind: OperationKind::Update,
            snapshot: Some(snapshot),
            version,
        }
    }

    pub fn delete(
        table: impl Into<String>,
        item_id: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        Self {
            table: table.into(),
            item_id: item_id.into(),
            kind: OperationKind::Delete,
            snapshot: None,
            version,
        }
    }
}

/// One not-yet-acknowledged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Push order; never reused
    pub sequence: u64,
    pub operation_id: Uuid,
    pub table: String,
    pub item_id: String,
    pub kind: OperationKind,
    /// Entity payload, `None` for deletes
    pub snapshot: Option<Value>,
    /// Version used as the `If-Match` precondition
    pub version_at_enqueue: Option<String>,
    #[serde(default)]
    pub state: OperationState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Bumped whenever a later mutation is collapsed into this operation
    #[serde(default)]
    pub revision: u32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What [`OperationQueue::enqueue`] did with a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new operation was appended
    Appended { sequence: u64 },
    /// Merged into the existing operation for the item
    Collapsed { sequence: u64, kind: OperationKind },
    /// The existing insert and the new delete cancelled each other out
    Cancelled { sequence: u64 },
}

impl EnqueueOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Appended { sequence }
            | Self::Collapsed { sequence, .. }
            | Self::Cancelled { sequence } => *sequence,
        }
    }
}

/// Result of merging a new mutation into an existing one
#[derive(Debug, Clone, PartialEq)]
pub enum Collapse {
    Merge {
        kind: OperationKind,
        snapshot: Option<Value>,
        version: Option<String>,
    },
    Remove,
}

/// Merge `incoming` into `existing`, or explain why the sequence is invalid
pub fn collapse(
    existing: &PendingOperation,
    incoming: &NewOperation,
) -> std::result::Result<Collapse, &'static str> {
    use OperationKind::*;

    let version = || {
        incoming
            .version
            .clone()
            .or_else(|| existing.version_at_enqueue.clone())
    };

    match (existing.kind, incoming.kind) {
        (Insert, Update) => Ok(Collapse::Merge {
            kind: Insert,
            snapshot: incoming.snapshot.clone(),
            version: None,
        }),
        (Insert, Delete) => Ok(Collapse::Remove),
        (Update, Update) => Ok(Collapse::Merge {
            kind: Update,
            snapshot: incoming.snapshot.clone(),
            version: version(),
        }),
        (Update, Delete) => Ok(Collapse::Merge {
            kind: Delete,
            snapshot: None,
            version: version(),
        }),
        (Delete, _) => Err("the item is deleted locally and the delete has not been pushed"),
        (Insert, Insert) => Err("the item is already queued for insertion"),
        (Update, Insert) => Err("the item already exists"),
    }
}

fn sequence_key(sequence: u64) -> String {
    format!("{:020}", sequence)
}

fn decode(row: StoredRow) -> Result<PendingOperation> {
    serde_json::from_value(row.data).map_err(|e| {
        SyncError::Serialization(format!("Corrupt pending operation {}: {}", row.id, e))
    })
}

// ============================================================================
// Queue
// ============================================================================

/// Persistent operation queue over the `__operations` table
#[derive(Clone)]
pub struct OperationQueue {
    store: LocalStore,
    clock: Arc<dyn Clock>,
}

impl OperationQueue {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append or collapse a mutation in its own transaction
    pub async fn enqueue(&self, operation: NewOperation) -> Result<EnqueueOutcome> {
        let mut tx = self.store.begin().await?;
        let outcome = self.stage_enqueue(&mut tx, operation).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Append or collapse a mutation inside `tx`
    pub async fn stage_enqueue(
        &self,
        tx: &mut SyncTransaction,
        operation: NewOperation,
    ) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let existing = Self::stage_find(tx, &operation.table, &operation.item_id).await?;

        let Some(mut existing) = existing else {
            let sequence = Self::stage_next_sequence(tx).await?;
            let pending = PendingOperation {
                sequence,
                operation_id: Uuid::new_v4(),
                table: operation.table,
                item_id: operation.item_id,
                kind: operation.kind,
                snapshot: operation.snapshot,
                version_at_enqueue: operation.version,
                state: OperationState::Pending,
                attempts: 0,
                last_error: None,
                revision: 0,
                enqueued_at: now,
                updated_at: now,
            };
            Self::stage_put(tx, &pending).await?;

            debug!(
                table = %pending.table,
                item_id = %pending.item_id,
                kind = %pending.kind,
                sequence,
                "Operation appended"
            );
            return Ok(EnqueueOutcome::Appended { sequence });
        };

        let sequence = existing.sequence;
        match collapse(&existing, &operation) {
            Err(reason) => Err(SyncError::InvalidOperationSequence {
                table: operation.table,
                id: operation.item_id,
                reason: format!("cannot {} ({})", operation.kind, reason),
            }),
            Ok(Collapse::Remove) => {
                tx.stage_delete(OPERATIONS_TABLE, &sequence_key(sequence))
                    .await?;
                debug!(
                    table = %existing.table,
                    item_id = %existing.item_id,
                    sequence,
                    "Insert cancelled by delete"
                );
                Ok(EnqueueOutcome::Cancelled { sequence })
            }
            Ok(Collapse::Merge {
                kind,
                snapshot,
                version,
            }) => {
                existing.kind = kind;
                existing.snapshot = snapshot;
                existing.version_at_enqueue = version;
                existing.revision += 1;
                existing.state = OperationState::Pending;
                existing.last_error = None;
                existing.updated_at = now;
                Self::stage_put(tx, &existing).await?;

                debug!(
                    table = %existing.table,
                    item_id = %existing.item_id,
                    kind = %kind,
                    sequence,
                    "Operation collapsed"
                );
                Ok(EnqueueOutcome::Collapsed { sequence, kind })
            }
        }
    }

    /// Operation with the lowest sequence number
    pub async fn peek(&self) -> Result<Option<PendingOperation>> {
        self.next_after(None).await
    }

    /// First operation with a sequence number greater than `after`
    pub async fn next_after(&self, after: Option<u64>) -> Result<Option<PendingOperation>> {
        let after_key = after.map(sequence_key);
        let mut rows = self
            .store
            .scan(OPERATIONS_TABLE, after_key.as_deref(), 1)
            .await?;
        rows.pop().map(decode).transpose()
    }

    pub async fn get(&self, sequence: u64) -> Result<Option<PendingOperation>> {
        self.store
            .get(OPERATIONS_TABLE, &sequence_key(sequence))
            .await?
            .map(|data| {
                decode(StoredRow {
                    id: sequence_key(sequence),
                    data,
                })
            })
            .transpose()
    }

    /// All operations in push order
    pub async fn all_pending(&self) -> Result<Vec<PendingOperation>> {
        self.store
            .scan_all(OPERATIONS_TABLE)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn pending_for_item(
        &self,
        table: &str,
        item_id: &str,
    ) -> Result<Option<PendingOperation>> {
        Ok(self
            .all_pending()
            .await?
            .into_iter()
            .find(|op| op.table == table && op.item_id == item_id))
    }

    /// Number of pending operations, optionally restricted to one table
    pub async fn count(&self, table: Option<&str>) -> Result<u64> {
        match table {
            None => self.store.count(OPERATIONS_TABLE).await,
            Some(table) => Ok(self
                .all_pending()
                .await?
                .iter()
                .filter(|op| op.table == table)
                .count() as u64),
        }
    }

    /// Remove an operation after it was pushed or abandoned
    pub async fn remove(&self, sequence: u64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if !Self::stage_remove(&mut tx, sequence).await? {
            return Err(SyncError::OperationNotFound(sequence));
        }
        tx.commit().await
    }

    /// Replace a stored operation, e.g. to persist attempt bookkeeping
    pub async fn update(&self, operation: &PendingOperation) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if Self::stage_get(&mut tx, operation.sequence).await?.is_none() {
            return Err(SyncError::OperationNotFound(operation.sequence));
        }
        Self::stage_put(&mut tx, operation).await?;
        tx.commit().await
    }

    /// Count an attempt against an operation that stays queued
    ///
    /// A no-op if the operation disappeared in the meantime.
    pub async fn record_attempt(
        &self,
        sequence: u64,
        state: OperationState,
        error: Option<String>,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let Some(mut operation) = Self::stage_get(&mut tx, sequence).await? else {
            return Ok(());
        };

        operation.state = state;
        operation.attempts += 1;
        operation.last_error = error;
        operation.updated_at = self.clock.now();
        Self::stage_put(&mut tx, &operation).await?;
        tx.commit().await
    }

    pub async fn stage_get(
        tx: &mut SyncTransaction,
        sequence: u64,
    ) -> Result<Option<PendingOperation>> {
        let key = sequence_key(sequence);
        tx.get(OPERATIONS_TABLE, &key)
            .await?
            .map(|data| decode(StoredRow { id: key, data }))
            .transpose()
    }

    pub async fn stage_put(tx: &mut SyncTransaction, operation: &PendingOperation) -> Result<()> {
        let data = serde_json::to_value(operation)?;
        tx.stage_upsert(OPERATIONS_TABLE, &sequence_key(operation.sequence), &data)
            .await
    }

    /// Returns whether an operation was removed
    pub async fn stage_remove(tx: &mut SyncTransaction, sequence: u64) -> Result<bool> {
        let key = sequence_key(sequence);
        if tx.get(OPERATIONS_TABLE, &key).await?.is_none() {
            return Ok(false);
        }
        tx.stage_delete(OPERATIONS_TABLE, &key).await?;
        Ok(true)
    }

    /// Number of operations of `table` as seen by `tx`
    pub async fn stage_count(tx: &mut SyncTransaction, table: &str) -> Result<u64> {
        let mut count = 0;
        for row in tx.scan_all(OPERATIONS_TABLE).await? {
            if decode(row)?.table == table {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop every operation of `table`, returning how many were dropped
    pub async fn stage_remove_table(tx: &mut SyncTransaction, table: &str) -> Result<u64> {
        let mut removed = 0;
        for row in tx.scan_all(OPERATIONS_TABLE).await? {
            let operation = decode(row)?;
            if operation.table == table {
                tx.stage_delete(OPERATIONS_TABLE, &sequence_key(operation.sequence))
                    .await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(table, removed, "Discarded pending operations");
        }
        Ok(removed)
    }

    async fn stage_find(
        tx: &mut SyncTransaction,
        table: &str,
        item_id: &str,
    ) -> Result<Option<PendingOperation>> {
        for row in tx.scan_all(OPERATIONS_TABLE).await? {
            let operation = decode(row)?;
            if operation.table == table && operation.item_id == item_id {
                return Ok(Some(operation));
            }
        }
        Ok(None)
    }

    async fn stage_next_sequence(tx: &mut SyncTransaction) -> Result<u64> {
        let current = tx
            .get(CONFIG_TABLE, SEQUENCE_KEY)
            .await?
            .and_then(|value| value.get("value").and_then(Value::as_u64))
            .unwrap_or(0);
        let next = current + 1;
        tx.stage_upsert(CONFIG_TABLE, SEQUENCE_KEY, &json!({ "value": next }))
            .await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaDescriptor, SchemaRegistry};
    use bridge_desktop::SqliteTableStore;
    use bridge_traits::time::FixedClock;
    use serde_json::json;

    async fn queue() -> OperationQueue {
        let store = SqliteTableStore::in_memory().await.unwrap();
        let registry = SchemaRegistry::new()
            .with(SchemaDescriptor::new("todoitem").unwrap())
            .unwrap();
        let local = LocalStore::new(Arc::new(store), Arc::new(registry));
        OperationQueue::new(local, Arc::new(FixedClock::new(Utc::now())))
    }

    fn existing(kind: OperationKind) -> PendingOperation {
        PendingOperation {
            sequence: 7,
            operation_id: Uuid::new_v4(),
            table: "todoitem".to_string(),
            item_id: "a".to_string(),
            kind,
            snapshot: Some(json!({ "id": "a", "title": "old" })),
            version_at_enqueue: Some("AQ==".to_string()),
            state: OperationState::Failed,
            attempts: 2,
            last_error: Some("conflict".to_string()),
            revision: 0,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_collapse_rules() {
        use OperationKind::*;

        let update = NewOperation::update("todoitem", "a", json!({ "id": "a", "title": "new" }), None);
        let delete = NewOperation::delete("todoitem", "a", Some("Ag==".to_string()));
        let insert = NewOperation::insert("todoitem", "a", json!({ "id": "a" }));

        assert_eq!(
            collapse(&existing(Insert), &update),
            Ok(Collapse::Merge {
                kind: Insert,
                snapshot: Some(json!({ "id": "a", "title": "new" })),
                version: None,
            })
        );
        assert_eq!(collapse(&existing(Insert), &delete), Ok(Collapse::Remove));
        assert_eq!(
            collapse(&existing(Update), &update),
            Ok(Collapse::Merge {
                kind: Update,
                snapshot: Some(json!({ "id": "a", "title": "new" })),
                version: Some("AQ==".to_string()),
            })
        );
        assert_eq!(
            collapse(&existing(Update), &delete),
            Ok(Collapse::Merge {
                kind: Delete,
                snapshot: None,
                version: Some("Ag==".to_string()),
            })
        );

        for incoming in [&insert, &update, &delete] {
            assert!(collapse(&existing(Delete), incoming).is_err());
        }
        assert!(collapse(&existing(Insert), &insert).is_err());
        assert!(collapse(&existing(Update), &insert).is_err());
    }

    #[tokio::test]
    async fn test_update_then_update_keeps_one_operation() {
        let queue = queue().await;

        let first = queue
            .enqueue(NewOperation::update("todoitem", "a", json!({ "id": "a", "n": 1 }), Some("AQ==".to_string())))
            .await
            .unwrap();
        let second = queue
            .enqueue(NewOperation::update("todoitem", "a", json!({ "id": "a", "n": 2 }), Some("AQ==".to_string())))
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Appended { sequence: 1 });
        assert_eq!(
            second,
            EnqueueOutcome::Collapsed {
                sequence: 1,
                kind: OperationKind::Update
            }
        );

        let pending = queue.all_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].snapshot, Some(json!({ "id": "a", "n": 2 })));
        assert_eq!(pending[0].revision, 1);
    }

    #[tokio::test]
    async fn test_insert_then_delete_leaves_nothing() {
        let queue = queue().await;

        queue
            .enqueue(NewOperation::insert("todoitem", "a", json!({ "id": "a" })))
            .await
            .unwrap();
        let outcome = queue
            .enqueue(NewOperation::delete("todoitem", "a", None))
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled { sequence: 1 });
        assert_eq!(queue.count(None).await.unwrap(), 0);
        assert!(queue.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_after_pending_delete_is_rejected() {
        let queue = queue().await;

        queue
            .enqueue(NewOperation::delete("todoitem", "a", Some("AQ==".to_string())))
            .await
            .unwrap();
        let result = queue
            .enqueue(NewOperation::insert("todoitem", "a", json!({ "id": "a" })))
            .await;

        assert!(matches!(
            result,
            Err(SyncError::InvalidOperationSequence { .. })
        ));
        assert_eq!(queue.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order_and_sequence_never_reused() {
        let queue = queue().await;
        for id in ["c", "a", "b"] {
            queue
                .enqueue(NewOperation::insert("todoitem", id, json!({ "id": id })))
                .await
                .unwrap();
        }

        let order: Vec<String> = queue
            .all_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.item_id)
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        queue.remove(3).await.unwrap();
        let next = queue
            .enqueue(NewOperation::insert("todoitem", "d", json!({ "id": "d" })))
            .await
            .unwrap();
        assert_eq!(next.sequence(), 4);

        let after_first = queue.next_after(Some(1)).await.unwrap().unwrap();
        assert_eq!(after_first.item_id, "a");
    }

    #[tokio::test]
    async fn test_sequence_ordering_past_nine() {
        let queue = queue().await;
        for n in 0..12 {
            let id = format!("item{}", n);
            queue
                .enqueue(NewOperation::insert("todoitem", id.clone(), json!({ "id": id })))
                .await
                .unwrap();
        }

        let sequences: Vec<u64> = queue
            .all_pending()
            .await
            .unwrap()
            .iter()
            .map(|op| op.sequence)
            .collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_remove_missing_operation() {
        let queue = queue().await;
        assert!(matches!(
            queue.remove(42).await,
            Err(SyncError::OperationNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_record_attempt_and_collapse_resets_state() {
        let queue = queue().await;
        queue
            .enqueue(NewOperation::update("todoitem", "a", json!({ "id": "a" }), None))
            .await
            .unwrap();

        queue
            .record_attempt(1, OperationState::Attempted, Some("timeout".to_string()))
            .await
            .unwrap();
        let attempted = queue.get(1).await.unwrap().unwrap();
        assert_eq!(attempted.state, OperationState::Attempted);
        assert_eq!(attempted.attempts, 1);
        assert_eq!(attempted.revision, 0);

        queue
            .enqueue(NewOperation::update("todoitem", "a", json!({ "id": "a", "n": 2 }), None))
            .await
            .unwrap();
        let collapsed = queue.get(1).await.unwrap().unwrap();
        assert_eq!(collapsed.state, OperationState::Pending);
        assert_eq!(collapsed.last_error, None);
        assert_eq!(collapsed.attempts, 1);
    }

    #[tokio::test]
    async fn test_count_and_pending_for_item() {
        let queue = queue().await;
        queue
            .enqueue(NewOperation::insert("todoitem", "a", json!({ "id": "a" })))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::insert("category", "x", json!({ "id": "x" })))
            .await
            .unwrap();

        assert_eq!(queue.count(None).await.unwrap(), 2);
        assert_eq!(queue.count(Some("todoitem")).await.unwrap(), 1);
        assert_eq!(queue.count(Some("missing")).await.unwrap(), 0);

        let op = queue.pending_for_item("category", "x").await.unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Insert);
        assert!(queue.pending_for_item("category", "a").await.unwrap().is_none());
    }
}
