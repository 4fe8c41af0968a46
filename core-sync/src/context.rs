//! # Sync Context
//!
//! The entry point of the engine: one value per local database, owning the
//! local store, the operation queue, the delta tracker and the remote.
//!
//! ## Overview
//!
//! Applications read and write entities through the context. Every local
//! mutation writes the entity row and enqueues its pending operation in one
//! store transaction, so the queue always describes exactly the local
//! changes the service has not seen.
//!
//! [`push`](SyncContext::push) and [`pull`](SyncContext::pull) are
//! serialized by the context's sync lock; concurrent calls wait their turn.
//! Local mutations do not take the sync lock.
//!
//! ## Usage
//!
//! ```ignore
//! let context = SyncContext::builder(table_store, remote)
//!     .schema(SchemaDescriptor::new("todoitem")?)
//!     .config(SyncConfig::new().with_query("all", PullQuery::new("todoitem")))
//!     .build()?;
//!
//! context.insert("todoitem", json!({ "title": "milk" })).await?;
//! let pushed = context.push(&CancellationToken::new()).await?;
//! let pulled = context.pull("all", &CancellationToken::new()).await?;
//! ```

use bridge_traits::network::NetworkMonitor;
use bridge_traits::remote::RemoteTable;
use bridge_traits::storage::TableStore;
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::events::{CoreEvent, EventBus, StoreEvent};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::config::SyncConfig;
use crate::conflict_resolver::ConflictResolver;
use crate::delta_tracker::DeltaTracker;
use crate::entity::{generate_id, Entity};
use crate::error::{Result, SyncError};
use crate::local_store::LocalStore;
use crate::operation_queue::{NewOperation, OperationQueue, PendingOperation};
use crate::pipeline::PushPipeline;
use crate::push::PushConflict;
use crate::schema::{SchemaDescriptor, SchemaRegistry};

/// Options of [`SyncContext::purge`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Drop the table's pending operations instead of refusing to purge
    pub discard_pending: bool,
    /// Reset only this query's delta token. All of the table's tokens are
    /// reset when `None`.
    pub query_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub rows: u64,
    pub discarded_operations: u64,
}

// ============================================================================
// Builder
// ============================================================================

pub struct SyncContextBuilder {
    store: Arc<dyn TableStore>,
    remote: Arc<dyn RemoteTable>,
    registry: SchemaRegistry,
    schemas: Vec<SchemaDescriptor>,
    config: SyncConfig,
    pipeline: PushPipeline,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    event_bus: Option<EventBus>,
    clock: Arc<dyn Clock>,
}

impl SyncContextBuilder {
    /// Register one table
    pub fn schema(mut self, descriptor: SchemaDescriptor) -> Self {
        self.schemas.push(descriptor);
        self
    }

    /// Start from an existing registry
    pub fn registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline(mut self, pipeline: PushPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<SyncContext> {
        let mut registry = self.registry;
        for descriptor in self.schemas {
            registry.register(descriptor)?;
        }
        if registry.is_empty() {
            return Err(SyncError::InvalidConfig(
                "At least one table must be registered".to_string(),
            ));
        }

        self.config.validate()?;
        for (name, query) in &self.config.queries {
            if !registry.contains(&query.table) {
                return Err(SyncError::InvalidConfig(format!(
                    "Pull query {} targets unregistered table {}",
                    name, query.table
                )));
            }
        }

        let registry = Arc::new(registry);
        let store = LocalStore::new(self.store, Arc::clone(&registry));
        let queue = OperationQueue::new(store.clone(), Arc::clone(&self.clock));
        let deltas = DeltaTracker::new(store.clone(), Arc::clone(&self.clock));
        let resolver = self.config.conflict_policy.resolver();

        info!(
            tables = ?registry.tables().collect::<Vec<_>>(),
            page_size = self.config.page_size,
            policy = ?self.config.conflict_policy,
            "Sync context ready"
        );

        Ok(SyncContext {
            registry,
            store,
            queue,
            deltas,
            remote: self.remote,
            config: self.config,
            resolver,
            pipeline: self.pipeline,
            network_monitor: self.network_monitor,
            event_bus: self.event_bus,
            clock: self.clock,
            sync_lock: Mutex::new(()),
        })
    }
}

// ============================================================================
// Context
// ============================================================================

pub struct SyncContext {
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) store: LocalStore,
    pub(crate) queue: OperationQueue,
    pub(crate) deltas: DeltaTracker,
    pub(crate) remote: Arc<dyn RemoteTable>,
    pub(crate) config: SyncConfig,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    pub(crate) pipeline: PushPipeline,
    pub(crate) network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub(crate) event_bus: Option<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    sync_lock: Mutex<()>,
}

impl SyncContext {
    pub fn builder(store: Arc<dyn TableStore>, remote: Arc<dyn RemoteTable>) -> SyncContextBuilder {
        SyncContextBuilder {
            store,
            remote,
            registry: SchemaRegistry::new(),
            schemas: Vec::new(),
            config: SyncConfig::default(),
            pipeline: PushPipeline::default(),
            network_monitor: None,
            event_bus: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn deltas(&self) -> &DeltaTracker {
        &self.deltas
    }

    /// Wait for the sync lock unless `cancel` fires first
    pub(crate) async fn acquire_sync_lock(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            guard = self.sync_lock.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }

    pub(crate) async fn is_online(&self) -> bool {
        match &self.network_monitor {
            Some(monitor) => monitor.is_connected().await,
            None => true,
        }
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        if let Some(bus) = &self.event_bus {
            trace!(event = event.description(), severity = ?event.severity(), "Event emitted");
            bus.emit(event).ok();
        }
    }

    // ------------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------------

    /// Insert a new entity, generating an id when it has none
    ///
    /// Returns the entity as stored.
    #[instrument(skip(self, item), fields(table = %table))]
    pub async fn insert(&self, table: &str, item: Entity) -> Result<Entity> {
        let schema = self.registry.get(table)?;
        let mut item = item;
        if !item.is_object() {
            return Err(SyncError::InvalidEntity {
                table: table.to_string(),
                reason: "entity must be a JSON object".to_string(),
            });
        }
        if item.get(schema.id_field()).map_or(true, |id| id.is_null()) {
            schema.set_id(&mut item, &generate_id());
        }
        let id = schema.require_id(&item)?;

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.get(table, &id).await? {
            if !schema.is_deleted(&existing) {
                return Err(SyncError::ItemAlreadyExists {
                    table: table.to_string(),
                    id,
                });
            }
        }

        self.queue
            .stage_enqueue(&mut tx, NewOperation::insert(table, id.as_str(), item.clone()))
            .await?;
        tx.stage_upsert(table, &id, &item).await?;
        tx.commit().await?;

        debug!(table, item_id = %id, "Item inserted");
        self.emit(CoreEvent::Store(StoreEvent::ItemInserted {
            table: table.to_string(),
            item_id: id,
        }));
        Ok(item)
    }

    /// Replace an existing entity
    ///
    /// The stored version is kept when `item` carries none, and is used as the
    /// precondition of the pushed update.
    #[instrument(skip(self, item), fields(table = %table))]
    pub async fn update(&self, table: &str, item: Entity) -> Result<Entity> {
        let schema = self.registry.get(table)?;
        let id = schema.require_id(&item)?;
        let mut item = item;

        let mut tx = self.store.begin().await?;
        let existing = tx
            .get(table, &id)
            .await?
            .filter(|existing| !schema.is_deleted(existing))
            .ok_or_else(|| SyncError::ItemNotFound {
                table: table.to_string(),
                id: id.clone(),
            })?;

        let known_version = schema.version_of(&existing).map(str::to_string);
        if schema.version_of(&item).is_none() {
            if let Some(version) = &known_version {
                schema.set_version(&mut item, version);
            }
        }

        self.queue
            .stage_enqueue(
                &mut tx,
                NewOperation::update(table, id.as_str(), item.clone(), known_version),
            )
            .await?;
        tx.stage_upsert(table, &id, &item).await?;
        tx.commit().await?;

        debug!(table, item_id = %id, "Item updated");
        self.emit(CoreEvent::Store(StoreEvent::ItemUpdated {
            table: table.to_string(),
            item_id: id,
        }));
        Ok(item)
    }

    #[instrument(skip(self), fields(table = %table, item_id = %id))]
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let schema = self.registry.get(table)?;

        let mut tx = self.store.begin().await?;
        let existing = tx
            .get(table, id)
            .await?
            .filter(|existing| !schema.is_deleted(existing))
            .ok_or_else(|| SyncError::ItemNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;

        let version = schema.version_of(&existing).map(str::to_string);
        self.queue
            .stage_enqueue(&mut tx, NewOperation::delete(table, id, version))
            .await?;
        tx.stage_delete(table, id).await?;
        tx.commit().await?;

        debug!("Item deleted");
        self.emit(CoreEvent::Store(StoreEvent::ItemDeleted {
            table: table.to_string(),
            item_id: id.to_string(),
        }));
        Ok(())
    }

    /// Live entity by id; soft-deleted rows are hidden
    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Entity>> {
        let schema = self.registry.get(table)?;
        Ok(self
            .store
            .get(table, id)
            .await?
            .filter(|item| !schema.is_deleted(item)))
    }

    /// Stream the live entities of `table` accepted by `predicate`
    pub fn query<'a, P>(
        &self,
        table: &'a str,
        predicate: P,
    ) -> Result<BoxStream<'a, Result<Entity>>>
    where
        P: Fn(&Entity) -> bool + Send + 'a,
    {
        let schema = self.registry.get(table)?.clone();
        Ok(self
            .store
            .query(table, move |item| !schema.is_deleted(item) && predicate(item)))
    }

    // ------------------------------------------------------------------------
    // Queue inspection and conflict follow-up
    // ------------------------------------------------------------------------

    /// Number of pending operations, optionally for one table
    pub async fn pending_operations(&self, table: Option<&str>) -> Result<u64> {
        if let Some(table) = table {
            self.registry.get(table)?;
        }
        self.queue.count(table).await
    }

    pub async fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.queue.all_pending().await
    }

    /// Settle a reported conflict by keeping `item` locally and dropping the
    /// conflicting operation
    #[instrument(skip(self, conflict, item), fields(sequence = conflict.operation.sequence))]
    pub async fn cancel_and_update(&self, conflict: &PushConflict, item: Entity) -> Result<()> {
        let operation = &conflict.operation;
        let schema = self.registry.get(&operation.table)?;
        let id = schema.require_id(&item)?;
        if id != operation.item_id {
            return Err(SyncError::InvalidEntity {
                table: operation.table.clone(),
                reason: format!(
                    "item {} does not match conflicting item {}",
                    id, operation.item_id
                ),
            });
        }

        let mut tx = self.store.begin().await?;
        if !OperationQueue::stage_remove(&mut tx, operation.sequence).await? {
            return Err(SyncError::OperationNotFound(operation.sequence));
        }
        tx.stage_upsert(&operation.table, &id, &item).await?;
        tx.commit().await?;

        info!(table = %operation.table, item_id = %id, "Conflict settled with local update");
        Ok(())
    }

    /// Settle a reported conflict by dropping the operation and adopting the
    /// server's copy, or removing the local row when there is none
    #[instrument(skip(self, conflict), fields(sequence = conflict.operation.sequence))]
    pub async fn cancel_and_discard(&self, conflict: &PushConflict) -> Result<()> {
        let operation = &conflict.operation;
        let schema = self.registry.get(&operation.table)?;

        let mut tx = self.store.begin().await?;
        if !OperationQueue::stage_remove(&mut tx, operation.sequence).await? {
            return Err(SyncError::OperationNotFound(operation.sequence));
        }
        match &conflict.server_item {
            Some(item) => {
                schema.require_id(item)?;
                tx.stage_upsert(&operation.table, &operation.item_id, item)
                    .await?
            }
            None => tx.stage_delete(&operation.table, &operation.item_id).await?,
        }
        tx.commit().await?;

        info!(
            table = %operation.table,
            item_id = %operation.item_id,
            "Conflict settled with server copy"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Make the next pull of `query_id` start from the beginning
    pub async fn reset_delta(&self, table: &str, query_id: &str) -> Result<()> {
        self.registry.get(table)?;
        let _guard = self.sync_lock.lock().await;
        self.deltas.reset(table, query_id).await
    }

    /// Make the next pull of every query of `table` start from the beginning
    pub async fn reset_table_deltas(&self, table: &str) -> Result<u64> {
        self.registry.get(table)?;
        let _guard = self.sync_lock.lock().await;
        self.deltas.reset_table(table).await
    }

    /// Remove every local row of `table` and reset its delta tokens
    ///
    /// Fails with [`SyncError::PendingOperations`] while the table has queued
    /// changes, unless `options.discard_pending` drops them.
    #[instrument(skip(self, options), fields(table = %table))]
    pub async fn purge(&self, table: &str, options: PurgeOptions) -> Result<PurgeStats> {
        self.registry.get(table)?;
        let _guard = self.sync_lock.lock().await;

        let mut tx = self.store.begin().await?;
        let pending = OperationQueue::stage_count(&mut tx, table).await?;
        if pending > 0 && !options.discard_pending {
            return Err(SyncError::PendingOperations {
                table: table.to_string(),
                count: pending,
            });
        }

        let discarded_operations = if options.discard_pending {
            OperationQueue::stage_remove_table(&mut tx, table).await?
        } else {
            0
        };
        let rows = tx.scan_all(table).await?.len() as u64;
        tx.clear(table).await?;
        match &options.query_id {
            Some(query_id) => DeltaTracker::stage_reset(&mut tx, table, query_id).await?,
            None => {
                DeltaTracker::stage_reset_table(&mut tx, table).await?;
            }
        }
        tx.commit().await?;

        info!(rows, discarded_operations, "Table purged");
        self.emit(CoreEvent::Store(StoreEvent::TablePurged {
            table: table.to_string(),
            rows,
            discarded_operations,
        }));
        Ok(PurgeStats {
            rows,
            discarded_operations,
        })
    }
}
