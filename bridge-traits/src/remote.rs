//! Remote Table Service Abstraction
//!
//! The consumed contract of the remote table service. Providers translate
//! these calls into the wire protocol (REST, in `provider-table-service`) and
//! classify every response into a [`RemoteOutcome`], so the sync engine never
//! inspects HTTP status codes itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Non-conflict failure of a remote call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, 408/429 or 5xx. Safe to retry later.
    #[error("Transient remote failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    /// The credentials were rejected (401)
    #[error("Remote rejected credentials (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// Any other 4xx. Retrying the same request will fail again.
    #[error("Remote rejected request (status {status}): {message}")]
    Permanent { status: u16, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Transient { status, .. } => *status,
            RemoteError::Unauthorized { status, .. } | RemoteError::Permanent { status, .. } => {
                Some(*status)
            }
        }
    }
}

/// Classified result of a remote write
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// The write was applied. Carries the server entity when the response had one.
    Ok(Option<Value>),
    /// 409 or 412: the precondition did not hold
    Conflict {
        status: u16,
        server_item: Option<Value>,
    },
    Failed(RemoteError),
}

/// Position after which a pull page starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub updated_at: DateTime<Utc>,
    /// Id of the last record already pulled at `updated_at`
    pub after_id: Option<String>,
}

/// One page of an incremental query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Caller supplied filter expression, ANDed with the watermark clause
    pub filter: Option<String>,
    pub watermark: Option<Watermark>,
    pub top: usize,
    pub include_deleted: bool,
    /// Wire names of the ordering fields
    pub updated_at_field: String,
    pub id_field: String,
}

/// A page of records returned by the service
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemotePage {
    pub items: Vec<Value>,
    /// Opaque continuation hint from the service
    pub next_link: Option<String>,
}

/// Remote table service trait
///
/// `if_match` carries the base64 version token of the item as last known
/// locally. `None` sends the write without a precondition.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Create an item
    async fn insert(&self, table: &str, item: &Value) -> RemoteOutcome;

    /// Update an item, guarded by `if_match`
    async fn update(
        &self,
        table: &str,
        id: &str,
        item: &Value,
        if_match: Option<String>,
    ) -> RemoteOutcome;

    /// Delete an item, guarded by `if_match`
    async fn delete(&self, table: &str, id: &str, if_match: Option<String>) -> RemoteOutcome;

    /// Fetch one page of an incremental query
    async fn query(&self, table: &str, request: &PageRequest) -> Result<RemotePage, RemoteError>;
}
