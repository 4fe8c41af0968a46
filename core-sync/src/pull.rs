//! # Pull
//!
//! Incremental download of remote changes into the local store.
//!
//! ## Overview
//!
//! Pages are requested ordered by `(updatedAt, id)` and filtered to records
//! strictly after the query's saved position. Every record of a page is
//! written verbatim, soft-deleted ones included, and the position advances
//! to the page's last record in the same transaction. A pull stops after a
//! page shorter than the page size, or at a page boundary when cancelled.
//!
//! A table with pending operations is never pulled: the pulled rows would
//! overwrite local changes the service has not seen yet.

use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, SyncEvent};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use bridge_traits::remote::{PageRequest, Watermark};

use crate::config::{validate_query_id, PullQuery};
use crate::context::SyncContext;
use crate::delta_tracker::{filter_fingerprint, DeltaState};
use crate::error::{Result, SyncError};
use crate::operation_queue::OperationQueue;
use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub status: PullStatus,
    /// Pages committed
    pub pages: u64,
    /// Distinct records written
    pub received: u64,
    /// Soft-deleted records among them
    pub deleted: u64,
    /// Position reached, if any record was ever pulled
    pub high_water_mark: Option<DateTime<Utc>>,
}

impl SyncContext {
    /// Run the named query from the sync configuration
    pub async fn pull(&self, name: &str, cancel: &CancellationToken) -> Result<PullResult> {
        let query = self.config.named_query(name)?;
        self.pull_query(query, cancel).await
    }

    /// Run an ad-hoc query. Without a query id the whole table is pulled and
    /// no progress is saved.
    #[instrument(skip(self, query, cancel), fields(table = %query.table, query_id = ?query.query_id))]
    pub async fn pull_query(&self, query: PullQuery, cancel: &CancellationToken) -> Result<PullResult> {
        let schema = self.registry.get(&query.table)?.clone();
        if let Some(query_id) = &query.query_id {
            validate_query_id(query_id)?;
        }

        let _guard = self.acquire_sync_lock(cancel).await?;

        let pending = self.queue.count(Some(&query.table)).await?;
        if pending > 0 {
            return Err(SyncError::PendingOperations {
                table: query.table.clone(),
                count: pending,
            });
        }

        let query_id = query.query_id.clone().unwrap_or_default();
        match self.run_pull(&schema, &query, cancel).await {
            Ok(result) => {
                info!(
                    pages = result.pages,
                    received = result.received,
                    deleted = result.deleted,
                    cancelled = result.status == PullStatus::Cancelled,
                    "Pull finished"
                );
                self.emit(CoreEvent::Sync(SyncEvent::PullCompleted {
                    table: query.table.clone(),
                    query_id,
                    pages: result.pages,
                    received: result.received,
                    cancelled: result.status == PullStatus::Cancelled,
                }));
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Pull failed");
                self.emit(CoreEvent::Sync(SyncEvent::Failed {
                    phase: "pull".to_string(),
                    message: e.to_string(),
                    recoverable: e.is_recoverable(),
                }));
                Err(e)
            }
        }
    }

    async fn run_pull(
        &self,
        schema: &SchemaDescriptor,
        query: &PullQuery,
        cancel: &CancellationToken,
    ) -> Result<PullResult> {
        let table = query.table.as_str();
        let fingerprint = filter_fingerprint(query.filter.as_deref());
        let mut state = self.load_state(query, fingerprint.as_deref()).await?;
        state.filter_fingerprint = fingerprint;

        let page_size = self.config.page_size;
        let mut result = PullResult {
            status: PullStatus::Complete,
            pages: 0,
            received: 0,
            deleted: 0,
            high_water_mark: None,
        };

        loop {
            if cancel.is_cancelled() {
                result.status = PullStatus::Cancelled;
                break;
            }

            let request = PageRequest {
                filter: query.filter.clone(),
                watermark: Some(Watermark {
                    updated_at: state.high_water_mark,
                    after_id: state.last_id.clone(),
                }),
                top: page_size,
                include_deleted: true,
                updated_at_field: schema.updated_at_field().to_string(),
                id_field: schema.id_field().to_string(),
            };
            let page = self.remote.query(table, &request).await?;
            let fetched = page.items.len();
            let full_page = fetched >= page_size;

            let before = (state.high_water_mark, state.last_id.clone());
            let items = dedup_page(schema, page.items, &mut state)?;
            if fetched > 0 && before == (state.high_water_mark, state.last_id.clone()) {
                return Err(SyncError::Remote {
                    status: None,
                    message: format!(
                        "Page of {} did not advance past {} / {:?}",
                        table,
                        before.0.to_rfc3339(),
                        before.1
                    ),
                });
            }
            state.last_page_incomplete = full_page;

            let deleted = self.commit_page(schema, query, &state, &items).await?;
            result.pages += 1;
            result.received += items.len() as u64;
            result.deleted += deleted;

            debug!(
                items = items.len(),
                deleted,
                high_water_mark = %state.high_water_mark.to_rfc3339(),
                "Pull page committed"
            );
            self.emit(CoreEvent::Sync(SyncEvent::PullPageCommitted {
                table: table.to_string(),
                query_id: query.query_id.clone().unwrap_or_default(),
                items: items.len() as u64,
                high_water_mark: state
                    .last_id
                    .as_ref()
                    .map(|_| state.high_water_mark.to_rfc3339()),
            }));

            if !full_page {
                break;
            }
        }

        result.high_water_mark = state.last_id.as_ref().map(|_| state.high_water_mark);
        Ok(result)
    }

    /// Saved position of the query, or the beginning
    async fn load_state(&self, query: &PullQuery, fingerprint: Option<&str>) -> Result<DeltaState> {
        let now = self.clock.now();
        let Some(query_id) = query.query_id.as_deref() else {
            return Ok(DeltaState::initial(&query.table, "", now));
        };

        match self.deltas.get(&query.table, query_id).await? {
            Some(state) if state.filter_fingerprint.as_deref() == fingerprint => Ok(state),
            Some(_) => {
                info!(query_id, "Query filter changed, pulling from the beginning");
                Ok(DeltaState::initial(&query.table, query_id, now))
            }
            None => Ok(DeltaState::initial(&query.table, query_id, now)),
        }
    }

    /// Write one page and its position atomically, returning the number of
    /// soft-deleted records written
    async fn commit_page(
        &self,
        schema: &SchemaDescriptor,
        query: &PullQuery,
        state: &DeltaState,
        items: &[(String, Value)],
    ) -> Result<u64> {
        let table = query.table.as_str();
        let mut tx = self.store.begin().await?;

        // A local write may have slipped in since the pull started
        let pending = OperationQueue::stage_count(&mut tx, table).await?;
        if pending > 0 {
            return Err(SyncError::PendingOperations {
                table: table.to_string(),
                count: pending,
            });
        }

        let mut deleted = 0;
        for (id, item) in items {
            if schema.is_deleted(item) {
                deleted += 1;
            }
            tx.stage_upsert(table, id, item).await?;
        }
        if query.query_id.is_some() {
            self.deltas.stage_save(&mut tx, state).await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Validate a page, advance `state` past it and keep the last copy of each id
fn dedup_page(
    schema: &SchemaDescriptor,
    items: Vec<Value>,
    state: &mut DeltaState,
) -> Result<Vec<(String, Value)>> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut unique: Vec<(String, Value)> = Vec::with_capacity(items.len());

    for item in items {
        let (id, updated_at) = schema.validate_remote(&item)?;
        state.advance(updated_at, &id);

        match positions.get(&id) {
            Some(&index) => unique[index].1 = item,
            None => {
                positions.insert(id.clone(), unique.len());
                unique.push((id, item));
            }
        }
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_keeps_last_copy_and_advances() {
        let schema = SchemaDescriptor::new("todoitem").unwrap();
        let mut state = DeltaState::initial("todoitem", "all", Utc::now());

        let items = vec![
            json!({ "id": "a", "updatedAt": "2024-01-01T00:00:00Z", "title": "first" }),
            json!({ "id": "b", "updatedAt": "2024-01-01T00:00:00Z" }),
            json!({ "id": "a", "updatedAt": "2024-01-01T00:00:00Z", "title": "second" }),
        ];

        let unique = dedup_page(&schema, items, &mut state).unwrap();
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].1["title"], "second");
        assert_eq!(state.last_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_dedup_rejects_invalid_records() {
        let schema = SchemaDescriptor::new("todoitem").unwrap();
        let mut state = DeltaState::initial("todoitem", "all", Utc::now());

        let result = dedup_page(
            &schema,
            vec![json!({ "id": "a" })],
            &mut state,
        );
        assert!(matches!(result, Err(SyncError::InvalidEntity { .. })));
    }
}
