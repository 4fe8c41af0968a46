//! # Host Bridge Traits
//!
//! Capability traits the sync core consumes and each host platform implements.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync engine and the outside
//! world. Each trait represents a capability the core requires but that is
//! implemented differently per platform (desktop, iOS, Android, web).
//!
//! ## Traits
//!
//! ### Storage
//! - [`TableStore`](storage::TableStore) - Transactional key-value rows keyed by `(table, id)`
//!
//! ### Remote
//! - [`RemoteTable`](remote::RemoteTable) - Table service collaborator with classified outcomes
//! - [`HttpClient`](http::HttpClient) - Async HTTP transport used by providers
//! - [`CredentialProvider`](auth::CredentialProvider) - Opaque `Authorization` header source
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity detection
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](logging::LoggerSink) - Forward structured logs to host logging
//!
//! ## Implementations
//!
//! `bridge-desktop` implements `HttpClient`, `TableStore` and
//! `NetworkMonitor` for desktop hosts. Mobile hosts supply their own through
//! the same traits.
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type, except
//! [`RemoteTable`](remote::RemoteTable), which returns classified
//! [`RemoteOutcome`](remote::RemoteOutcome) values because conflicts and
//! rejected writes are expected results rather than failures.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks. Implementations must ensure thread safety.

pub mod auth;
pub mod error;
pub mod http;
pub mod logging;
pub mod network;
pub mod remote;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use auth::{CredentialProvider, StaticTokenProvider};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
pub use network::{NetworkMonitor, NetworkStatus};
pub use remote::{PageRequest, RemoteError, RemoteOutcome, RemotePage, RemoteTable, Watermark};
pub use storage::{StoreTransaction, StoredRow, TableStore};
pub use logging::{LogEntry, LogLevel, LoggerSink};
pub use time::{Clock, FixedClock, SystemClock};
