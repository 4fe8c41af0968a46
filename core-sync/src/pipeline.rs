//! # Push Pipeline
//!
//! The explicit stages every pending operation passes through on push.
//!
//! ## Overview
//!
//! 1. **filter**: every [`OperationFilter`] must accept the operation, or it
//!    stays queued and is skipped for this cycle
//! 2. **transform**: each [`OperationTransform`] may rewrite the payload sent
//!    to the service. The persisted operation is never changed.
//! 3. **execute**: the remote call, classified into an [`OperationOutcome`]
//! 4. **post-hook**: each [`PushHook`] observes the operation and its outcome
//!
//! Stages run in registration order.

use async_trait::async_trait;
use bridge_traits::remote::{RemoteError, RemoteOutcome};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::operation_queue::PendingOperation;

/// Classified result of executing one operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Accepted; carries the server entity when the response had one
    Ok(Option<Value>),
    /// 409 or 412
    Conflict {
        status: u16,
        server_item: Option<Value>,
    },
    Transient(String),
    Unauthorized(String),
    Permanent { status: u16, message: String },
}

impl From<RemoteOutcome> for OperationOutcome {
    fn from(outcome: RemoteOutcome) -> Self {
        match outcome {
            RemoteOutcome::Ok(item) => OperationOutcome::Ok(item),
            RemoteOutcome::Conflict {
                status,
                server_item,
            } => OperationOutcome::Conflict {
                status,
                server_item,
            },
            RemoteOutcome::Failed(RemoteError::Transient { message, .. }) => {
                OperationOutcome::Transient(message)
            }
            RemoteOutcome::Failed(RemoteError::Unauthorized { message, .. }) => {
                OperationOutcome::Unauthorized(message)
            }
            RemoteOutcome::Failed(RemoteError::Permanent { status, message }) => {
                OperationOutcome::Permanent { status, message }
            }
        }
    }
}

/// Decides whether an operation is pushed in the current cycle
pub trait OperationFilter: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, operation: &PendingOperation) -> bool;
}

/// Rewrites the payload of an outgoing operation
pub trait OperationTransform: Send + Sync {
    fn name(&self) -> &str;

    /// `payload` is the snapshot as it stands after earlier transforms.
    /// Returning `Err` aborts the push cycle.
    fn transform(
        &self,
        operation: &PendingOperation,
        payload: Option<Value>,
    ) -> std::result::Result<Option<Value>, String>;
}

/// Observes each executed operation
#[async_trait]
pub trait PushHook: Send + Sync {
    async fn after_push(&self, operation: &PendingOperation, outcome: &OperationOutcome);
}

/// Only lets operations on the given tables through
#[derive(Debug, Clone)]
pub struct TableFilter {
    tables: HashSet<String>,
}

impl TableFilter {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }
}

impl OperationFilter for TableFilter {
    fn name(&self) -> &str {
        "table_filter"
    }

    fn accept(&self, operation: &PendingOperation) -> bool {
        self.tables.contains(&operation.table)
    }
}

/// Ordered set of filters, transforms and hooks
#[derive(Clone, Default)]
pub struct PushPipeline {
    filters: Vec<Arc<dyn OperationFilter>>,
    transforms: Vec<Arc<dyn OperationTransform>>,
    hooks: Vec<Arc<dyn PushHook>>,
}

impl PushPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Arc<dyn OperationFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn OperationTransform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PushHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Filter stage
    pub fn accepts(&self, operation: &PendingOperation) -> bool {
        match self.filters.iter().find(|f| !f.accept(operation)) {
            Some(filter) => {
                debug!(
                    filter = filter.name(),
                    sequence = operation.sequence,
                    "Operation skipped by filter"
                );
                false
            }
            None => true,
        }
    }

    /// Transform stage: the payload to send for `operation`
    pub fn prepare(&self, operation: &PendingOperation) -> Result<Option<Value>> {
        let mut payload = operation.snapshot.clone();
        for transform in &self.transforms {
            payload = transform
                .transform(operation, payload)
                .map_err(|message| SyncError::Pipeline {
                    stage: transform.name().to_string(),
                    message,
                })?;
        }
        Ok(payload)
    }

    /// Post-hook stage
    pub async fn notify(&self, operation: &PendingOperation, outcome: &OperationOutcome) {
        for hook in &self.hooks {
            hook.after_push(operation, outcome).await;
        }
    }
}
