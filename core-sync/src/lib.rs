//! # Offline Table Sync Engine
//!
//! Keeps a local copy of remote tables usable while disconnected and
//! reconciles it with the service later.
//!
//! ## Overview
//!
//! - Local writes go to the local store and are recorded as pending
//!   operations in a durable queue
//! - Push replays the queue in order, exactly one operation per item, and
//!   surfaces conflicts through a resolver
//! - Pull downloads changes incrementally, resuming after the last record
//!   it committed
//!
//! ## Components
//!
//! - **Schema** (`schema`): which JSON members carry the system properties
//! - **Local Store** (`local_store`): transactional entity storage over a host `TableStore`
//! - **Operation Queue** (`operation_queue`): ordered pending operations with collapsing
//! - **Delta Tracker** (`delta_tracker`): per-query pull positions
//! - **Conflict Resolver** (`conflict_resolver`): push conflict policies
//! - **Push Pipeline** (`pipeline`): filter, transform and hook stages of a push
//! - **Sync Context** (`context`, `push`, `pull`): the public entry point

pub mod config;
pub mod conflict_resolver;
pub mod context;
pub mod delta_tracker;
pub mod entity;
pub mod error;
pub mod local_store;
pub mod operation_queue;
pub mod pipeline;
pub mod pull;
pub mod push;
pub mod schema;

pub use config::{PullQuery, SyncConfig};
pub use conflict_resolver::{
    AbortOnConflict, AlwaysClientWins, AlwaysServerWins, ConflictOutcome, ConflictPolicy,
    ConflictRecord, ConflictResolver, FnResolver,
};
pub use context::{PurgeOptions, PurgeStats, SyncContext, SyncContextBuilder};
pub use delta_tracker::{DeltaState, DeltaTracker};
pub use entity::{Entity, Version};
pub use error::{Result, SyncError};
pub use local_store::LocalStore;
pub use operation_queue::{
    EnqueueOutcome, NewOperation, OperationKind, OperationQueue, OperationState, PendingOperation,
};
pub use pipeline::{
    OperationFilter, OperationOutcome, OperationTransform, PushHook, PushPipeline, TableFilter,
};
pub use pull::{PullResult, PullStatus};
pub use push::{PushConflict, PushError, PushResult, PushStatus};
pub use schema::{SchemaDescriptor, SchemaRegistry};

pub use tokio_util::sync::CancellationToken;
