//! Table service REST client
//!
//! Implements the `RemoteTable` trait over an injected `HttpClient`.

use async_trait::async_trait;
use bridge_traits::auth::CredentialProvider;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::remote::{PageRequest, RemoteError, RemoteOutcome, RemotePage, RemoteTable};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{Result, TableServiceError};
use crate::types::{PageResponse, ServiceErrorBody};

/// Protocol version header sent with every request
pub const API_VERSION_HEADER: &str = "ZUMO-API-VERSION";

/// Protocol version spoken by this client
pub const API_VERSION: &str = "3.0.0";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Table service API client
///
/// Every response is classified into a [`RemoteOutcome`] or [`RemoteError`]:
///
/// | Status | Classification |
/// |--------|----------------|
/// | 2xx | ok |
/// | 409, 412 | conflict, body is the server item when parseable |
/// | 401 | unauthorized |
/// | 408, 429, 5xx, transport failure | transient |
/// | other 4xx | permanent |
///
/// # Example
///
/// ```ignore
/// use provider_table_service::TableServiceClient;
///
/// let client = TableServiceClient::new(http_client, "https://todo.example.com")?
///     .with_credentials(credentials);
/// let outcome = client.insert("todoitem", &json!({ "id": "a", "title": "milk" })).await;
/// ```
pub struct TableServiceClient {
    /// HTTP client for API requests
    http_client: Arc<dyn HttpClient>,

    /// Service root without trailing slash
    base_url: String,

    /// Source of the `Authorization` header
    credentials: Option<Arc<dyn CredentialProvider>>,

    timeout: Duration,
}

impl TableServiceClient {
    /// Create a new client for the service rooted at `base_url`
    pub fn new(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Result<Self> {
        let base_url: String = base_url.into();
        let invalid = |reason: String| TableServiceError::InvalidBaseUrl {
            url: base_url.clone(),
            reason,
        };

        let parsed = Url::parse(&base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https".to_string()));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed".to_string()));
        }

        let trimmed = parsed.as_str().trim_end_matches('/');

        Ok(Self {
            http_client,
            base_url: trimmed.to_string(),
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/tables/{}", self.base_url, urlencoding::encode(table))
    }

    fn item_url(&self, table: &str, id: &str) -> String {
        format!("{}/{}", self.table_url(table), urlencoding::encode(id))
    }

    /// Build the `$filter`, `$orderby`, `$top` query string for a page
    fn page_url(&self, table: &str, request: &PageRequest) -> String {
        let mut clauses = Vec::new();

        if let Some(watermark) = &request.watermark {
            let at = odata_timestamp(&watermark.updated_at);
            let field = &request.updated_at_field;
            let clause = match &watermark.after_id {
                // Keyset continuation: strictly after (updatedAt, id)
                Some(after_id) => format!(
                    "(({field} gt {at}) or ({field} eq {at} and {id} gt {after}))",
                    field = field,
                    at = at,
                    id = request.id_field,
                    after = odata_string(after_id),
                ),
                None => format!("({} ge {})", field, at),
            };
            clauses.push(clause);
        }

        if let Some(filter) = request.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            clauses.push(format!("({})", filter));
        }

        let mut params = Vec::new();
        if !clauses.is_empty() {
            params.push(format!(
                "$filter={}",
                urlencoding::encode(&clauses.join(" and "))
            ));
        }
        params.push(format!(
            "$orderby={}",
            urlencoding::encode(&format!("{},{}", request.updated_at_field, request.id_field))
        ));
        params.push(format!("$top={}", request.top));
        if request.include_deleted {
            params.push("__includeDeleted=true".to_string());
        }

        format!("{}?{}", self.table_url(table), params.join("&"))
    }

    /// Attach protocol and credential headers, then send
    async fn send(&self, mut request: HttpRequest) -> std::result::Result<HttpResponse, RemoteError> {
        request = request
            .header(API_VERSION_HEADER, API_VERSION)
            .header("Accept", "application/json")
            .timeout(self.timeout);

        if let Some(credentials) = &self.credentials {
            let header = credentials
                .authorization()
                .await
                .map_err(|e| RemoteError::Transient {
                    status: None,
                    message: format!("Credential provider failed: {}", e),
                })?;
            if let Some(value) = header {
                request = request.header("Authorization", value);
            }
        }

        let method = request.method;
        self.http_client.execute(request).await.map_err(|e| {
            warn!(method = method.as_str(), error = %e, "Table service request failed");
            RemoteError::Transient {
                status: None,
                message: e.to_string(),
            }
        })
    }

    async fn write(&self, request: HttpRequest) -> RemoteOutcome {
        match self.send(request).await {
            Ok(response) => classify_write(&response),
            Err(error) => RemoteOutcome::Failed(error),
        }
    }

    fn json_request(method: HttpMethod, url: String, item: &Value) -> Result<HttpRequest> {
        HttpRequest::new(method, url)
            .json(item)
            .map_err(|e| TableServiceError::EncodeError(e.to_string()))
    }
}

#[async_trait]
impl RemoteTable for TableServiceClient {
    #[instrument(skip(self, item), fields(table = %table))]
    async fn insert(&self, table: &str, item: &Value) -> RemoteOutcome {
        let request = match Self::json_request(HttpMethod::Post, self.table_url(table), item) {
            Ok(request) => request,
            Err(e) => return RemoteOutcome::Failed(e.into()),
        };
        self.write(request).await
    }

    #[instrument(skip(self, item, if_match), fields(table = %table, id = %id))]
    async fn update(
        &self,
        table: &str,
        id: &str,
        item: &Value,
        if_match: Option<String>,
    ) -> RemoteOutcome {
        let mut request =
            match Self::json_request(HttpMethod::Patch, self.item_url(table, id), item) {
                Ok(request) => request,
                Err(e) => return RemoteOutcome::Failed(e.into()),
            };
        if let Some(version) = if_match {
            request = request.header("If-Match", etag(&version));
        }
        self.write(request).await
    }

    #[instrument(skip(self, if_match), fields(table = %table, id = %id))]
    async fn delete(&self, table: &str, id: &str, if_match: Option<String>) -> RemoteOutcome {
        let mut request = HttpRequest::new(HttpMethod::Delete, self.item_url(table, id));
        if let Some(version) = if_match {
            request = request.header("If-Match", etag(&version));
        }
        self.write(request).await
    }

    #[instrument(skip(self, request), fields(table = %table, top = request.top))]
    async fn query(
        &self,
        table: &str,
        request: &PageRequest,
    ) -> std::result::Result<RemotePage, RemoteError> {
        let url = self.page_url(table, request);
        debug!(url = %url, "Requesting page");

        let response = self.send(HttpRequest::new(HttpMethod::Get, url)).await?;
        if !response.is_success() {
            return Err(classify_error(&response));
        }

        let page: PageResponse =
            serde_json::from_slice(&response.body).map_err(|e| TableServiceError::ParseError {
                status: response.status,
                message: e.to_string(),
            })?;
        let (items, next_link) = page.into_parts();

        debug!(items = items.len(), has_next = next_link.is_some(), "Page received");

        Ok(RemotePage { items, next_link })
    }
}

/// Quote a base64 version as an entity tag
fn etag(version: &str) -> String {
    if version.starts_with('"') {
        version.to_string()
    } else {
        format!("\"{}\"", version)
    }
}

fn odata_timestamp(at: &DateTime<Utc>) -> String {
    format!(
        "cast({},Edm.DateTimeOffset)",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn parse_item(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object)
}

fn classify_write(response: &HttpResponse) -> RemoteOutcome {
    match response.status {
        200..=299 => {
            let item = parse_item(&response.body);
            if item.is_none() && !response.body.is_empty() {
                warn!(status = response.status, "Write succeeded with a non-entity body");
            }
            RemoteOutcome::Ok(item)
        }
        409 | 412 => RemoteOutcome::Conflict {
            status: response.status,
            server_item: parse_item(&response.body),
        },
        _ => RemoteOutcome::Failed(classify_error(response)),
    }
}

fn classify_error(response: &HttpResponse) -> RemoteError {
    let status = response.status;
    let message = serde_json::from_slice::<ServiceErrorBody>(&response.body)
        .ok()
        .and_then(|body| body.describe())
        .unwrap_or_else(|| String::from_utf8_lossy(&response.body).into_owned());

    match status {
        401 => RemoteError::Unauthorized { status, message },
        408 | 429 | 500..=599 => RemoteError::Transient {
            status: Some(status),
            message,
        },
        _ => RemoteError::Permanent { status, message },
    }
}
