//! Credential Provider Abstraction
//!
//! Token acquisition lives outside the core. The table service provider asks
//! this trait for an `Authorization` header value before every request.

use async_trait::async_trait;

use crate::error::Result;

/// Opaque credential source
///
/// # Example
///
/// ```ignore
/// use bridge_traits::auth::CredentialProvider;
///
/// async fn decorate(provider: &dyn CredentialProvider, request: HttpRequest) -> Result<HttpRequest> {
///     Ok(match provider.authorization().await? {
///         Some(value) => request.header("Authorization", value),
///         None => request,
///     })
/// }
/// ```
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Full `Authorization` header value, or `None` for anonymous access
    async fn authorization(&self) -> Result<Option<String>>;
}

/// Fixed bearer token, mostly useful for tests and service accounts
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn authorization(&self) -> Result<Option<String>> {
        Ok(Some(format!("Bearer {}", self.token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_provider() {
        let provider = StaticTokenProvider::new("abc");

        assert_eq!(
            provider.authorization().await.unwrap(),
            Some("Bearer abc".to_string())
        );
        assert!(!format!("{:?}", provider).contains("abc"));
    }
}
