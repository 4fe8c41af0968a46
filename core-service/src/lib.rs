//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host configuration into a ready sync engine: it opens
//! the local store, builds the table service client over the host HTTP
//! client and hands both to a [`SyncContext`]. Desktop apps typically enable
//! the `desktop-shims` feature (which depends on `bridge-desktop`) so the
//! SQLite store is opened from `CoreConfig::database_path` when no store was
//! injected.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//! use core_sync::{PullQuery, SchemaDescriptor, SchemaRegistry, SyncConfig};
//!
//! let config = CoreConfig::builder()
//!     .service_url("https://todo.example.com")
//!     .database_path("/path/to/tablesync.db")
//!     .build()?;
//! let registry = SchemaRegistry::new().with(SchemaDescriptor::new("todoitem")?)?;
//! let sync = SyncConfig::new().with_query("all", PullQuery::new("todoitem"));
//!
//! let core = CoreService::bootstrap(config, sync, registry).await?;
//! core.context().insert("todoitem", serde_json::json!({ "text": "milk" })).await?;
//! let report = core.synchronize(&CancellationToken::new()).await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::TableStore;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
use core_runtime::logging::init_logging;
use core_sync::{
    CancellationToken, PullResult, PushPipeline, PushResult, SchemaRegistry, SyncConfig,
    SyncContext, SyncError,
};
use provider_table_service::TableServiceClient;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, info, instrument, warn};

/// Outcome of a full push-then-pull cycle
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub push: PushResult,
    /// Pull results keyed by query name, in name order
    pub pulls: Vec<(String, PullResult)>,
    /// Queries not pulled because their table still has queued operations
    pub skipped_pulls: Vec<String>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    context: Arc<SyncContext>,
    event_bus: EventBus,
}

impl CoreService {
    /// Bootstrap the engine from host configuration.
    ///
    /// # Errors
    ///
    /// - `CapabilityMissing` when no table store was injected and
    ///   `desktop-shims` is disabled
    /// - `InitializationFailed` when the store cannot be opened
    /// - `Sync` when the schema registry or sync configuration is invalid
    pub async fn bootstrap(
        config: CoreConfig,
        sync_config: SyncConfig,
        registry: SchemaRegistry,
    ) -> Result<Self> {
        Self::bootstrap_with_pipeline(config, sync_config, registry, PushPipeline::default()).await
    }

    /// Same as [`CoreService::bootstrap`] with custom push stages.
    #[instrument(skip_all, fields(service_url = %config.service_url))]
    pub async fn bootstrap_with_pipeline(
        config: CoreConfig,
        sync_config: SyncConfig,
        registry: SchemaRegistry,
        pipeline: PushPipeline,
    ) -> Result<Self> {
        config.validate()?;

        if let Some(logging) = &config.logging {
            // A second bootstrap in the same process finds a subscriber in place
            if let Err(e) = init_logging(logging.clone()) {
                warn!(error = %e, "Logging not installed");
            }
        }

        let store = open_table_store(&config).await?;

        let mut client = TableServiceClient::new(config.http_client.clone(), &config.service_url)?
            .with_timeout(config.request_timeout);
        if let Some(credentials) = &config.credential_provider {
            client = client.with_credentials(credentials.clone());
        }

        let event_bus = EventBus::new(config.event_buffer_size);

        let mut builder = SyncContext::builder(store, Arc::new(client))
            .registry(registry)
            .config(sync_config)
            .pipeline(pipeline)
            .event_bus(event_bus.clone());
        match &config.network_monitor {
            Some(monitor) => builder = builder.network_monitor(monitor.clone()),
            None => warn!("No network monitor configured; pushes assume connectivity"),
        }
        let context = builder.build()?;

        info!(
            tables = context.registry().tables().count(),
            queries = context.config().queries.len(),
            "Core service ready"
        );

        Ok(Self {
            context: Arc::new(context),
            event_bus,
        })
    }

    /// The sync engine.
    pub fn context(&self) -> Arc<SyncContext> {
        Arc::clone(&self.context)
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    /// Subscribe to events at or above `severity`.
    ///
    /// `EventSeverity::Warning` yields conflicts and failures only.
    pub fn event_stream(&self, severity: EventSeverity) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
            .filter(move |event| event.severity() >= severity)
    }

    /// Push every pending operation, then pull each named query.
    ///
    /// Pulls only run when the push was not stopped early. A query whose
    /// table still has queued operations after the push (unresolved
    /// conflicts, filtered operations or writes made during the cycle) is
    /// listed in `skipped_pulls` instead of failing the cycle, so the push
    /// conflicts always reach the caller.
    #[instrument(skip(self, cancel))]
    pub async fn synchronize(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let push = self.context.push(cancel).await?;
        let mut report = SyncReport {
            push,
            pulls: Vec::new(),
            skipped_pulls: Vec::new(),
        };

        if !report.push.is_complete() {
            info!(status = report.push.status.as_str(), "Push incomplete; skipping pull");
            return Ok(report);
        }

        let mut queries: Vec<(String, String)> = self
            .context
            .config()
            .queries
            .iter()
            .map(|(name, query)| (name.clone(), query.table.clone()))
            .collect();
        queries.sort();

        for (name, table) in queries {
            if cancel.is_cancelled() {
                break;
            }

            let pending = self.context.pending_operations(Some(&table)).await?;
            if pending > 0 {
                debug!(
                    query = %name,
                    table = %table,
                    pending,
                    "Table has queued operations; skipping pull"
                );
                report.skipped_pulls.push(name);
                continue;
            }

            match self.context.pull(&name, cancel).await {
                Ok(result) => report.pulls.push((name, result)),
                // A local write landed between the check and the pull
                Err(SyncError::PendingOperations { .. }) => report.skipped_pulls.push(name),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}

async fn open_table_store(config: &CoreConfig) -> Result<Arc<dyn TableStore>> {
    if let Some(store) = &config.table_store {
        return Ok(store.clone());
    }
    open_default_store(config).await
}

#[cfg(feature = "desktop-shims")]
async fn open_default_store(config: &CoreConfig) -> Result<Arc<dyn TableStore>> {
    use bridge_desktop::SqliteTableStore;

    let store = SqliteTableStore::new(config.database_path.clone())
        .await
        .map_err(|e| CoreError::InitializationFailed(format!("Failed to open local store: {}", e)))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
async fn open_default_store(_config: &CoreConfig) -> Result<Arc<dyn TableStore>> {
    Err(CoreError::CapabilityMissing {
        capability: "TableStore".to_string(),
        message: "No table store provided. Inject one with CoreConfig::builder().table_store(...) \
                  or enable the 'desktop-shims' feature to use the SQLite store."
            .to_string(),
    })
}
