//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! This crate provides desktop implementations of the bridge traits the sync
//! core consumes:
//! - `HttpClient` using `reqwest`
//! - `TableStore` using a SQLite database through `sqlx`
//! - `NetworkMonitor` using a TCP probe against the service host
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteTableStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new().unwrap();
//!     let store = SqliteTableStore::new("/path/to/tablesync.db".into()).await.unwrap();
//!
//!     // Hand both to core-service or straight to a SyncContext
//! }
//! ```

mod http;
mod network;
mod table_store;

pub use http::ReqwestHttpClient;
pub use network::DesktopNetworkMonitor;
pub use table_store::SqliteTableStore;
