//! # Push
//!
//! Drains the operation queue to the remote service, strictly in sequence
//! order and one operation at a time.
//!
//! ## Outcomes
//!
//! - **Ok**: the server copy replaces the local row and the operation is
//!   removed, in one transaction
//! - **Conflict**: the configured resolver decides (see
//!   [`conflict_resolver`](crate::conflict_resolver))
//! - **Transient**: the cycle stops; later operations are not attempted
//! - **Unauthorized**: the cycle stops; the operation stays queued
//! - **Permanent**: the operation is dropped and reported in
//!   [`PushResult::errors`]
//!
//! Cancellation is honored before each operation and between the transform
//! stage and the remote call. Once a remote call is made its result is
//! committed.
//!
//! An operation can change locally while its push is in flight. Each
//! operation carries a revision that is bumped on every collapse; a success
//! only removes the operation if the revision is unchanged, otherwise the
//! newer local change is kept and rebased on the server's version.

use core_runtime::events::{CoreEvent, SyncEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::conflict_resolver::{ConflictOutcome, ConflictRecord};
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::local_store::SyncTransaction;
use crate::operation_queue::{
    NewOperation, OperationKind, OperationQueue, OperationState, PendingOperation,
};
use crate::pipeline::{OperationOutcome, PushPipeline, TableFilter};
use bridge_traits::remote::RemoteOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushStatus {
    #[default]
    Complete,
    CancelledByToken,
    CancelledByNetworkError,
    CancelledByAuthenticationError,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::CancelledByToken => "cancelled_by_token",
            Self::CancelledByNetworkError => "cancelled_by_network_error",
            Self::CancelledByAuthenticationError => "cancelled_by_authentication_error",
        }
    }
}

/// A conflict left for the application
#[derive(Debug, Clone, PartialEq)]
pub struct PushConflict {
    pub operation: PendingOperation,
    pub server_item: Option<Value>,
    pub status: u16,
}

/// An operation the service rejected for good; it is no longer queued
#[derive(Debug, Clone, PartialEq)]
pub struct PushError {
    pub operation: PendingOperation,
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushResult {
    pub status: PushStatus,
    /// Operations accepted by the service
    pub succeeded: u64,
    /// Conflicts settled by the resolver in favor of the server
    pub resolved: u64,
    pub conflicts: Vec<PushConflict>,
    pub errors: Vec<PushError>,
    /// Reason the cycle stopped on a transient failure
    pub transient: Option<String>,
    pub authentication_error: Option<String>,
    /// Operations held back by a filter
    pub skipped: u64,
}

impl PushResult {
    pub fn is_complete(&self) -> bool {
        self.status == PushStatus::Complete
    }
}

enum Flow {
    Continue,
    Stop(PushStatus),
}

impl SyncContext {
    /// Push every pending operation
    pub async fn push(&self, cancel: &CancellationToken) -> Result<PushResult> {
        self.run_push(self.pipeline.clone(), cancel).await
    }

    /// Push only the operations of `tables`
    pub async fn push_tables(
        &self,
        tables: &[&str],
        cancel: &CancellationToken,
    ) -> Result<PushResult> {
        for table in tables {
            self.registry.get(table)?;
        }
        let pipeline = self
            .pipeline
            .clone()
            .with_filter(Arc::new(TableFilter::new(tables.iter().copied())));
        self.run_push(pipeline, cancel).await
    }

    #[instrument(skip(self, pipeline, cancel))]
    async fn run_push(
        &self,
        pipeline: PushPipeline,
        cancel: &CancellationToken,
    ) -> Result<PushResult> {
        let _guard = self.acquire_sync_lock(cancel).await?;
        let mut result = PushResult::default();

        if !self.is_online().await {
            warn!("Network is offline, push skipped");
            result.status = PushStatus::CancelledByNetworkError;
            result.transient = Some("Network is offline".to_string());
            self.emit_push_completed(&result);
            return Ok(result);
        }

        let pending = self.queue.count(None).await?;
        info!(pending, "Push started");
        self.emit(CoreEvent::Sync(SyncEvent::PushStarted { pending }));

        if let Err(e) = self.drain(&pipeline, cancel, &mut result).await {
            error!(error = %e, "Push failed");
            self.emit(CoreEvent::Sync(SyncEvent::Failed {
                phase: "push".to_string(),
                message: e.to_string(),
                recoverable: e.is_recoverable(),
            }));
            return Err(e);
        }

        info!(
            status = result.status.as_str(),
            succeeded = result.succeeded,
            resolved = result.resolved,
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            skipped = result.skipped,
            "Push finished"
        );
        self.emit_push_completed(&result);
        Ok(result)
    }

    async fn drain(
        &self,
        pipeline: &PushPipeline,
        cancel: &CancellationToken,
        result: &mut PushResult,
    ) -> Result<()> {
        let mut cursor = None;

        loop {
            if cancel.is_cancelled() {
                result.status = PushStatus::CancelledByToken;
                return Ok(());
            }

            let Some(operation) = self.queue.next_after(cursor).await? else {
                return Ok(());
            };
            cursor = Some(operation.sequence);

            if !pipeline.accepts(&operation) {
                result.skipped += 1;
                continue;
            }

            if let Flow::Stop(status) = self
                .push_operation(pipeline, operation, cancel, result)
                .await?
            {
                result.status = status;
                return Ok(());
            }
        }
    }

    async fn push_operation(
        &self,
        pipeline: &PushPipeline,
        mut operation: PendingOperation,
        cancel: &CancellationToken,
        result: &mut PushResult,
    ) -> Result<Flow> {
        let mut client_retries = 0;

        loop {
            let payload = pipeline.prepare(&operation)?;
            if cancel.is_cancelled() {
                return Ok(Flow::Stop(PushStatus::CancelledByToken));
            }

            let outcome: OperationOutcome = self.execute(&operation, payload).await?.into();
            pipeline.notify(&operation, &outcome).await;

            match outcome {
                OperationOutcome::Ok(server_item) => {
                    self.commit_success(&operation, server_item).await?;
                    result.succeeded += 1;

                    debug!(
                        table = %operation.table,
                        item_id = %operation.item_id,
                        kind = %operation.kind,
                        sequence = operation.sequence,
                        "Operation pushed"
                    );
                    self.emit(CoreEvent::Sync(SyncEvent::OperationPushed {
                        table: operation.table.clone(),
                        item_id: operation.item_id.clone(),
                        kind: operation.kind.as_str().to_string(),
                        sequence: operation.sequence,
                    }));
                    return Ok(Flow::Continue);
                }
                OperationOutcome::Conflict {
                    status,
                    server_item,
                } => {
                    let mut record = ConflictRecord {
                        operation: operation.clone(),
                        server_item,
                        status,
                    };
                    let resolution = self.resolver.resolve(&mut record);

                    warn!(
                        table = %operation.table,
                        item_id = %operation.item_id,
                        status,
                        resolution = resolution.as_str(),
                        "Push conflict"
                    );
                    self.emit(CoreEvent::Sync(SyncEvent::ConflictDetected {
                        table: operation.table.clone(),
                        item_id: operation.item_id.clone(),
                        status,
                        resolution: resolution.as_str().to_string(),
                    }));

                    match resolution {
                        ConflictOutcome::ClientWins
                            if client_retries < self.config.max_conflict_retries =>
                        {
                            client_retries += 1;
                            operation = self.rebase_for_retry(record);
                        }
                        ConflictOutcome::ServerWins => {
                            self.adopt_server(&record).await?;
                            result.resolved += 1;
                            return Ok(Flow::Continue);
                        }
                        ConflictOutcome::ClientWins | ConflictOutcome::Abort => {
                            let reason = match resolution {
                                ConflictOutcome::Abort => format!("conflict (status {})", status),
                                _ => format!(
                                    "conflict (status {}) unresolved after {} retries",
                                    status, client_retries
                                ),
                            };
                            self.queue
                                .record_attempt(
                                    operation.sequence,
                                    OperationState::Failed,
                                    Some(reason),
                                )
                                .await?;
                            result.conflicts.push(PushConflict {
                                operation: record.operation,
                                server_item: record.server_item,
                                status,
                            });
                            return Ok(Flow::Continue);
                        }
                    }
                }
                OperationOutcome::Transient(message) => {
                    warn!(sequence = operation.sequence, error = %message, "Transient push failure");
                    self.queue
                        .record_attempt(
                            operation.sequence,
                            OperationState::Attempted,
                            Some(message.clone()),
                        )
                        .await?;
                    result.transient = Some(message);
                    return Ok(Flow::Stop(PushStatus::CancelledByNetworkError));
                }
                OperationOutcome::Unauthorized(message) => {
                    warn!(sequence = operation.sequence, error = %message, "Push rejected credentials");
                    self.queue
                        .record_attempt(
                            operation.sequence,
                            OperationState::Attempted,
                            Some(message.clone()),
                        )
                        .await?;
                    result.authentication_error = Some(message);
                    return Ok(Flow::Stop(PushStatus::CancelledByAuthenticationError));
                }
                OperationOutcome::Permanent { status, message } => {
                    error!(
                        table = %operation.table,
                        item_id = %operation.item_id,
                        status,
                        error = %message,
                        "Operation rejected"
                    );
                    self.drop_rejected(&operation).await?;
                    result.errors.push(PushError {
                        operation,
                        status,
                        message,
                    });
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    async fn execute(
        &self,
        operation: &PendingOperation,
        payload: Option<Value>,
    ) -> Result<RemoteOutcome> {
        let table = operation.table.as_str();
        let missing_payload = || SyncError::InvalidEntity {
            table: operation.table.clone(),
            reason: format!("operation {} has no payload", operation.sequence),
        };

        Ok(match operation.kind {
            OperationKind::Insert => {
                let item = payload.ok_or_else(missing_payload)?;
                self.remote.insert(table, &item).await
            }
            OperationKind::Update => {
                let item = payload.ok_or_else(missing_payload)?;
                self.remote
                    .update(
                        table,
                        &operation.item_id,
                        &item,
                        operation.version_at_enqueue.clone(),
                    )
                    .await
            }
            OperationKind::Delete => {
                self.remote
                    .delete(
                        table,
                        &operation.item_id,
                        operation.version_at_enqueue.clone(),
                    )
                    .await
            }
        })
    }

    /// In-memory copy of a conflicting operation, guarded by the server's
    /// version instead of the stale one
    fn rebase_for_retry(&self, record: ConflictRecord) -> PendingOperation {
        let mut operation = record.operation;
        let server_version = self
            .registry
            .get(&operation.table)
            .ok()
            .zip(record.server_item.as_ref())
            .and_then(|(schema, item)| schema.version_of(item).map(str::to_string));

        if operation.kind == OperationKind::Insert {
            operation.kind = OperationKind::Update;
        }
        operation.version_at_enqueue = server_version;
        operation
    }

    async fn commit_success(
        &self,
        operation: &PendingOperation,
        server_item: Option<Value>,
    ) -> Result<()> {
        let schema = self.registry.get(&operation.table)?;
        let server_version = server_item
            .as_ref()
            .and_then(|item| schema.version_of(item))
            .map(str::to_string);

        let mut tx = self.store.begin().await?;
        match OperationQueue::stage_get(&mut tx, operation.sequence).await? {
            Some(current) if current.revision == operation.revision => {
                OperationQueue::stage_remove(&mut tx, operation.sequence).await?;
                match (operation.kind, server_item) {
                    (OperationKind::Delete, _) => {
                        tx.stage_delete(&operation.table, &operation.item_id).await?
                    }
                    (_, Some(item)) => {
                        schema.require_id(&item)?;
                        tx.stage_upsert(&operation.table, &operation.item_id, &item)
                            .await?
                    }
                    (_, None) => {}
                }
            }
            Some(current) => {
                self.rebase_pending(&mut tx, current, server_version).await?;
            }
            None if operation.kind == OperationKind::Insert => {
                // Deleted locally while the insert was in flight
                debug!(
                    table = %operation.table,
                    item_id = %operation.item_id,
                    "Queueing delete for item removed during push"
                );
                self.queue
                    .stage_enqueue(
                        &mut tx,
                        NewOperation::delete(
                            operation.table.as_str(),
                            operation.item_id.as_str(),
                            server_version,
                        ),
                    )
                    .await?;
            }
            None => {}
        }
        tx.commit().await
    }

    /// Keep a locally changed operation, now guarded by `server_version`
    async fn rebase_pending(
        &self,
        tx: &mut SyncTransaction,
        mut current: PendingOperation,
        server_version: Option<String>,
    ) -> Result<()> {
        let schema = self.registry.get(&current.table)?;

        if current.kind == OperationKind::Insert {
            current.kind = OperationKind::Update;
        }
        if let Some(version) = &server_version {
            current.version_at_enqueue = Some(version.clone());
            if let Some(snapshot) = current.snapshot.as_mut() {
                schema.set_version(snapshot, version);
            }
            if let Some(mut row) = tx.get(&current.table, &current.item_id).await? {
                schema.set_version(&mut row, version);
                tx.stage_upsert(&current.table, &current.item_id, &row)
                    .await?;
            }
        }
        current.updated_at = self.clock.now();

        debug!(
            table = %current.table,
            item_id = %current.item_id,
            sequence = current.sequence,
            "Operation changed during push, rebased on server version"
        );
        OperationQueue::stage_put(tx, &current).await
    }

    async fn adopt_server(&self, record: &ConflictRecord) -> Result<()> {
        let operation = &record.operation;
        let schema = self.registry.get(&operation.table)?;
        let server_version = record
            .server_item
            .as_ref()
            .and_then(|item| schema.version_of(item))
            .map(str::to_string);

        let mut tx = self.store.begin().await?;
        match OperationQueue::stage_get(&mut tx, operation.sequence).await? {
            Some(current) if current.revision == operation.revision => {
                OperationQueue::stage_remove(&mut tx, operation.sequence).await?;
                match &record.server_item {
                    Some(item) => {
                        schema.require_id(item)?;
                        tx.stage_upsert(&operation.table, &operation.item_id, item)
                            .await?
                    }
                    None => tx.stage_delete(&operation.table, &operation.item_id).await?,
                }
            }
            Some(current) => self.rebase_pending(&mut tx, current, server_version).await?,
            None => {}
        }
        tx.commit().await
    }

    async fn drop_rejected(&self, operation: &PendingOperation) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if let Some(current) = OperationQueue::stage_get(&mut tx, operation.sequence).await? {
            if current.revision == operation.revision {
                OperationQueue::stage_remove(&mut tx, operation.sequence).await?;
            }
        }
        tx.commit().await
    }

    fn emit_push_completed(&self, result: &PushResult) {
        self.emit(CoreEvent::Sync(SyncEvent::PushCompleted {
            status: result.status.as_str().to_string(),
            succeeded: result.succeeded,
            conflicts: result.conflicts.len() as u64,
            errors: result.errors.len() as u64,
        }));
    }
}
