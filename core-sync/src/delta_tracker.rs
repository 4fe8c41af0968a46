//! # Delta Tracker
//!
//! Persists how far each pull query has progressed.
//!
//! ## Overview
//!
//! A pull query's position is the `(updatedAt, id)` pair of the last record
//! committed locally, stored under `dt.{table}.{queryId}` in the
//! `__deltaTokens` table. The next pull resumes strictly after that pair, so
//! records sharing a timestamp across a page boundary are neither skipped
//! nor fetched twice.
//!
//! Saves go through [`DeltaTracker::stage_save`] so a page of records and the
//! position it advances to land in the same transaction.
//!
//! A query's filter is fingerprinted when its state is saved. Pulling the
//! same query id with a different filter starts over from the beginning.

use bridge_traits::storage::StoredRow;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::local_store::{LocalStore, SyncTransaction};

/// Logical table holding delta tokens
pub const DELTA_TOKENS_TABLE: &str = "__deltaTokens";

/// Key of a query's delta token
pub fn delta_key(table: &str, query_id: &str) -> String {
    format!("dt.{}.{}", table, query_id)
}

/// Stable fingerprint of a pull filter
pub fn filter_fingerprint(filter: Option<&str>) -> Option<String> {
    filter.map(|filter| {
        let mut hasher = Sha256::new();
        hasher.update(filter.as_bytes());
        format!("{:x}", hasher.finalize())
    })
}

/// Progress of one pull query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaState {
    pub table: String,
    pub query_id: String,
    /// Largest `updatedAt` committed so far
    pub high_water_mark: DateTime<Utc>,
    /// Id of the last committed record at `high_water_mark`
    pub last_id: Option<String>,
    /// Whether the last committed page was full, i.e. more data may follow
    #[serde(default)]
    pub last_page_incomplete: bool,
    #[serde(default)]
    pub filter_fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeltaState {
    /// Initial state: nothing pulled yet
    pub fn initial(table: &str, query_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            table: table.to_string(),
            query_id: query_id.to_string(),
            high_water_mark: DateTime::<Utc>::UNIX_EPOCH,
            last_id: None,
            last_page_incomplete: false,
            filter_fingerprint: None,
            updated_at: now,
        }
    }

    /// Move to `(updated_at, id)` if it is past the current position
    ///
    /// Returns whether the position changed. The position never moves back.
    pub fn advance(&mut self, updated_at: DateTime<Utc>, id: &str) -> bool {
        let ahead = match updated_at.cmp(&self.high_water_mark) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.last_id.as_deref().map_or(true, |last| id > last),
            std::cmp::Ordering::Less => false,
        };

        if ahead {
            self.high_water_mark = updated_at;
            self.last_id = Some(id.to_string());
        }
        ahead
    }

    pub fn position(&self) -> (DateTime<Utc>, Option<&str>) {
        (self.high_water_mark, self.last_id.as_deref())
    }
}

/// Reads and writes delta tokens
#[derive(Clone)]
pub struct DeltaTracker {
    store: LocalStore,
    clock: Arc<dyn Clock>,
}

impl DeltaTracker {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn get(&self, table: &str, query_id: &str) -> Result<Option<DeltaState>> {
        let key = delta_key(table, query_id);
        self.store
            .get(DELTA_TOKENS_TABLE, &key)
            .await?
            .map(|data| decode(StoredRow { id: key, data }))
            .transpose()
    }

    /// Saved state of a query, or the initial state when there is none
    pub async fn get_or_initial(&self, table: &str, query_id: &str) -> Result<DeltaState> {
        Ok(self
            .get(table, query_id)
            .await?
            .unwrap_or_else(|| DeltaState::initial(table, query_id, self.clock.now())))
    }

    /// All saved states of a table
    pub async fn states_for_table(&self, table: &str) -> Result<Vec<DeltaState>> {
        let prefix = format!("dt.{}.", table);
        self.store
            .scan_all(DELTA_TOKENS_TABLE)
            .await?
            .into_iter()
            .filter(|row| row.id.starts_with(&prefix))
            .map(decode)
            .collect()
    }

    /// Persist `state` as part of `tx`
    pub async fn stage_save(&self, tx: &mut SyncTransaction, state: &DeltaState) -> Result<()> {
        let mut state = state.clone();
        state.updated_at = self.clock.now();

        let data = serde_json::to_value(&state)?;
        tx.stage_upsert(
            DELTA_TOKENS_TABLE,
            &delta_key(&state.table, &state.query_id),
            &data,
        )
        .await?;

        debug!(
            table = %state.table,
            query_id = %state.query_id,
            high_water_mark = %state.high_water_mark.to_rfc3339(),
            last_id = ?state.last_id,
            "Delta token staged"
        );
        Ok(())
    }

    /// Forget a query's progress so its next pull starts over
    pub async fn reset(&self, table: &str, query_id: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        Self::stage_reset(&mut tx, table, query_id).await?;
        tx.commit().await?;

        info!(table, query_id, "Delta token reset");
        Ok(())
    }

    /// Forget the progress of every query of `table`, returning how many were reset
    pub async fn reset_table(&self, table: &str) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let removed = Self::stage_reset_table(&mut tx, table).await?;
        tx.commit().await?;

        info!(table, removed, "Delta tokens reset");
        Ok(removed)
    }

    pub async fn stage_reset(tx: &mut SyncTransaction, table: &str, query_id: &str) -> Result<()> {
        tx.stage_delete(DELTA_TOKENS_TABLE, &delta_key(table, query_id))
            .await
    }

    pub async fn stage_reset_table(tx: &mut SyncTransaction, table: &str) -> Result<u64> {
        let prefix = format!("dt.{}.", table);
        let mut removed = 0;
        for row in tx.scan_all(DELTA_TOKENS_TABLE).await? {
            if row.id.starts_with(&prefix) {
                tx.stage_delete(DELTA_TOKENS_TABLE, &row.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn decode(row: StoredRow) -> Result<DeltaState> {
    serde_json::from_value(row.data)
        .map_err(|e| SyncError::Serialization(format!("Corrupt delta token {}: {}", row.id, e)))
}
