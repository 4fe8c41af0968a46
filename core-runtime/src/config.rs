//! # Core Configuration Module
//!
//! Provides host-level configuration for the table sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the service location, storage location and the bridge
//! implementations the core talks through. It enforces fail-fast validation so
//! a missing capability is reported at startup rather than on the first push.
//!
//! ## Required Settings
//!
//! - `service_url` - Base URL of the table service (`http://` or `https://`)
//! - `database_path` - SQLite file backing the local store
//!
//! ## Bridges (with platform defaults)
//!
//! - `HttpClient` - HTTP transport (desktop default: reqwest)
//! - `NetworkMonitor` - Connectivity detection (desktop default: TCP probe of the service host)
//! - `CredentialProvider` - `Authorization` header source (optional; anonymous when absent)
//! - `TableStore` - Local storage (desktop default: SQLite, opened by `core-service`)
//!
//! When the `desktop-shims` feature is enabled, the desktop defaults are
//! injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .service_url("https://todo.example.com")
//!     .database_path("/path/to/tablesync.db")
//!     .build()
//!     .expect("Failed to build config");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{CredentialProvider, HttpClient, NetworkMonitor, TableStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use crate::logging::LoggingConfig;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Core configuration for the table sync core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Base URL of the table service
    pub service_url: String,

    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Per-request timeout applied by the table service client
    pub request_timeout: Duration,

    /// Buffer size of the event bus
    pub event_buffer_size: usize,

    /// HTTP client for talking to the service (required)
    pub http_client: Arc<dyn HttpClient>,

    /// Authorization header source (optional)
    pub credential_provider: Option<Arc<dyn CredentialProvider>>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Local store (optional; `core-service` opens the desktop default when absent)
    pub table_store: Option<Arc<dyn TableStore>>,

    /// Subscriber installed by `core-service` at bootstrap (optional)
    pub logging: Option<LoggingConfig>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("service_url", &self.service_url)
            .field("database_path", &self.database_path)
            .field("request_timeout", &self.request_timeout)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("http_client", &"HttpClient { ... }")
            .field(
                "credential_provider",
                &self
                    .credential_provider
                    .as_ref()
                    .map(|_| "CredentialProvider { ... }"),
            )
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field(
                "table_store",
                &self.table_store.as_ref().map(|_| "TableStore { ... }"),
            )
            .field("logging", &self.logging)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Service URL uses http or https and names a host
    /// - Database path is not empty
    /// - Request timeout and event buffer size are non-zero
    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.service_url).map_err(|e| {
            Error::Config(format!("Invalid service URL '{}': {}", self.service_url, e))
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Service URL must use http or https, got '{}'",
                self.service_url
            )));
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(Error::Config("Service URL must name a host".to_string()));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout)
        .map_err(|e| Error::Internal(format!("Failed to create default HttpClient: {}", e)))?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the table service. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject the platform HTTP stack (URLSession/OkHttp)."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_network_monitor(service_url: &str) -> Option<Arc<dyn NetworkMonitor>> {
    use bridge_desktop::DesktopNetworkMonitor;

    DesktopNetworkMonitor::for_service_url(service_url)
        .map(|monitor| Arc::new(monitor) as Arc<dyn NetworkMonitor>)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_network_monitor(_service_url: &str) -> Option<Arc<dyn NetworkMonitor>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    service_url: Option<String>,
    database_path: Option<PathBuf>,
    request_timeout: Option<Duration>,
    event_buffer_size: Option<usize>,
    http_client: Option<Arc<dyn HttpClient>>,
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    table_store: Option<Arc<dyn TableStore>>,
    logging: Option<LoggingConfig>,
}

impl CoreConfigBuilder {
    /// Sets the base URL of the table service. Trailing slashes are removed.
    pub fn service_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.service_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    /// Sets the path to the SQLite database file.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Injects an HTTP client. Required unless `desktop-shims` is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Injects the local store, bypassing the SQLite default.
    pub fn table_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.table_store = Some(store);
        self
    }

    /// Installs a global `tracing` subscriber during bootstrap.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error if:
    /// - The service URL or database path is missing
    /// - No `HttpClient` was injected and `desktop-shims` is disabled
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let service_url = self.service_url.ok_or_else(|| {
            Error::Config("Service URL is required. Use .service_url() to set it.".to_string())
        })?;

        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(request_timeout)?,
        };

        let network_monitor = self
            .network_monitor
            .or_else(|| provide_default_network_monitor(&service_url));

        let config = CoreConfig {
            service_url,
            database_path,
            request_timeout,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            http_client,
            credential_provider: self.credential_provider,
            network_monitor,
            table_store: self.table_store,
            logging: self.logging,
        };

        config.validate()?;

        Ok(config)
    }
}
