//! Network Monitoring Abstraction
//!
//! Lets the sync engine skip a push or pull up front when the host knows it
//! is offline, instead of discovering it through a failed request.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: TCP probe against the service host
/// - **iOS**: Network framework, Reachability
/// - **Android**: ConnectivityManager
///
/// # Example
///
/// ```ignore
/// use bridge_traits::network::NetworkMonitor;
///
/// async fn should_sync(monitor: &dyn NetworkMonitor) -> bool {
///     monitor.is_connected().await
/// }
/// ```
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network status
    async fn status(&self) -> Result<NetworkStatus>;

    /// Check if a sync attempt is worth making
    ///
    /// Only a definite `Disconnected` counts as offline; an unknown status or a
    /// failing monitor lets the request decide.
    async fn is_connected(&self) -> bool {
        !matches!(self.status().await, Ok(NetworkStatus::Disconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMonitor(NetworkStatus);

    #[async_trait]
    impl NetworkMonitor for FixedMonitor {
        async fn status(&self) -> Result<NetworkStatus> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_is_connected_treats_unknown_as_online() {
        assert!(FixedMonitor(NetworkStatus::Connected).is_connected().await);
        assert!(FixedMonitor(NetworkStatus::Indeterminate).is_connected().await);
        assert!(!FixedMonitor(NetworkStatus::Disconnected).is_connected().await);
    }
}
