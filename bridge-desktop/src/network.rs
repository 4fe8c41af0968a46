//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkMonitor, NetworkStatus},
};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Desktop network monitor implementation
///
/// Probes the table service host with a TCP connect. A successful probe is
/// cached for `cache_ttl` so back-to-back push and pull calls do not pay for
/// two probes.
pub struct DesktopNetworkMonitor {
    probe_addr: String,
    probe_timeout: Duration,
    cache_ttl: Duration,
    cached: Mutex<Option<(tokio::time::Instant, NetworkStatus)>>,
}

impl DesktopNetworkMonitor {
    /// Create a monitor probing `probe_addr` (`host:port`)
    pub fn new(probe_addr: impl Into<String>) -> Self {
        Self {
            probe_addr: probe_addr.into(),
            probe_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(10),
            cached: Mutex::new(None),
        }
    }

    /// Derive the probe address from a service URL
    ///
    /// Returns `None` when the URL has no host.
    pub fn for_service_url(service_url: &str) -> Option<Self> {
        let parsed = Url::parse(service_url).ok()?;
        let host = parsed.host_str().filter(|host| !host.is_empty())?;
        let port = parsed.port_or_known_default()?;

        Some(Self::new(format!("{}:{}", host, port)))
    }

    /// Override the probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Override how long a probe result is reused
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(self.probe_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) => NetworkStatus::Disconnected,
            Err(_) => NetworkStatus::Indeterminate,
        }
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn status(&self) -> Result<NetworkStatus> {
        let mut cached = self.cached.lock().await;

        if let Some((checked_at, status)) = *cached {
            if checked_at.elapsed() < self.cache_ttl {
                return Ok(status);
            }
        }

        let status = self.check_connectivity().await;
        *cached = Some((tokio::time::Instant::now(), status));
        debug!(probe = %self.probe_addr, status = ?status, "Network status updated");

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_address_from_url() {
        let https = DesktopNetworkMonitor::for_service_url("https://example.com/tables").unwrap();
        assert_eq!(https.probe_addr(), "example.com:443");

        let http = DesktopNetworkMonitor::for_service_url("http://localhost:5000/").unwrap();
        assert_eq!(http.probe_addr(), "localhost:5000");

        let plain = DesktopNetworkMonitor::for_service_url("http://svc.local").unwrap();
        assert_eq!(plain.probe_addr(), "svc.local:80");

        assert!(DesktopNetworkMonitor::for_service_url("not a url").is_none());
    }

    #[test]
    fn test_probe_address_ignores_userinfo_and_path() {
        let monitor =
            DesktopNetworkMonitor::for_service_url("https://user:pw@todo.example.com/api?x=1#top")
                .unwrap();
        assert_eq!(monitor.probe_addr(), "todo.example.com:443");

        let ipv6 = DesktopNetworkMonitor::for_service_url("http://[::1]:8080/").unwrap();
        assert_eq!(ipv6.probe_addr(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_local_listener_is_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = DesktopNetworkMonitor::new(addr.to_string());
        assert_eq!(monitor.status().await.unwrap(), NetworkStatus::Connected);
        assert!(monitor.is_connected().await);
    }

    #[tokio::test]
    async fn test_closed_port_is_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor = DesktopNetworkMonitor::new(addr.to_string()).with_cache_ttl(Duration::ZERO);
        assert_eq!(monitor.status().await.unwrap(), NetworkStatus::Disconnected);
    }
}
