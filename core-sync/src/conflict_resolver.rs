//! Conflict Resolution for Push Operations
//!
//! Decides what happens when the service rejects a write because the item
//! changed remotely.
//!
//! ## Overview
//!
//! A push conflict is a 409 or 412 answer to a guarded write. The push loop
//! hands the rejected operation and the server's copy (when the response
//! carried one) to a [`ConflictResolver`], which picks one outcome:
//!
//! - **ClientWins**: resubmit the local change against the server's version
//! - **ServerWins**: drop the local change and adopt the server's copy
//! - **Abort**: keep the operation queued and report the conflict
//!
//! Resolvers are synchronous and must be deterministic: the same record
//! always produces the same outcome. A resolver may edit the operation's
//! snapshot before answering `ClientWins` to resubmit a merged entity.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::conflict_resolver::{ConflictPolicy, FnResolver, ConflictOutcome};
//!
//! let policy = ConflictPolicy::Custom(Arc::new(FnResolver::new(|record| {
//!     if record.operation.table == "settings" {
//!         ConflictOutcome::ClientWins
//!     } else {
//!         ConflictOutcome::ServerWins
//!     }
//! })));
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::operation_queue::PendingOperation;

/// A rejected push, as seen by a resolver
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub operation: PendingOperation,
    /// Server copy of the item, if the conflict response included it
    pub server_item: Option<Value>,
    /// HTTP status of the rejection (409 or 412)
    pub status: u16,
}

impl ConflictRecord {
    /// The local entity the push tried to write
    pub fn client_item(&self) -> Option<&Value> {
        self.operation.snapshot.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    ClientWins,
    ServerWins,
    Abort,
}

impl ConflictOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Abort => "abort",
        }
    }
}

/// Conflict resolution strategy
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, record: &mut ConflictRecord) -> ConflictOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysServerWins;

impl ConflictResolver for AlwaysServerWins {
    fn resolve(&self, _record: &mut ConflictRecord) -> ConflictOutcome {
        ConflictOutcome::ServerWins
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysClientWins;

impl ConflictResolver for AlwaysClientWins {
    fn resolve(&self, _record: &mut ConflictRecord) -> ConflictOutcome {
        ConflictOutcome::ClientWins
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnConflict;

impl ConflictResolver for AbortOnConflict {
    fn resolve(&self, _record: &mut ConflictRecord) -> ConflictOutcome {
        ConflictOutcome::Abort
    }
}

/// Adapts a closure into a [`ConflictResolver`]
pub struct FnResolver<F>(F);

impl<F> FnResolver<F>
where
    F: Fn(&mut ConflictRecord) -> ConflictOutcome + Send + Sync,
{
    pub fn new(resolve: F) -> Self {
        Self(resolve)
    }
}

impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(&mut ConflictRecord) -> ConflictOutcome + Send + Sync,
{
    fn resolve(&self, record: &mut ConflictRecord) -> ConflictOutcome {
        (self.0)(record)
    }
}

/// Conflict resolution policy of a sync context
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    ClientWins,
    ServerWins,
    /// Leave conflicts for the application
    #[default]
    Abort,
    Custom(Arc<dyn ConflictResolver>),
}

impl ConflictPolicy {
    pub fn resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            Self::ClientWins => Arc::new(AlwaysClientWins),
            Self::ServerWins => Arc::new(AlwaysServerWins),
            Self::Abort => Arc::new(AbortOnConflict),
            Self::Custom(resolver) => Arc::clone(resolver),
        }
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientWins => f.write_str("ClientWins"),
            Self::ServerWins => f.write_str("ServerWins"),
            Self::Abort => f.write_str("Abort"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
