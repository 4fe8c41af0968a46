//! Table service wire types
//!
//! Data structures for deserializing table service responses.

use serde::Deserialize;
use serde_json::Value;

/// Body of a `GET /tables/{table}` response
///
/// Older services return a bare array; newer ones wrap it in an envelope
/// carrying a continuation link.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PageResponse {
    Items(Vec<Value>),
    Envelope {
        items: Vec<Value>,
        #[serde(rename = "nextLink", default)]
        next_link: Option<String>,
    },
}

impl PageResponse {
    pub fn into_parts(self) -> (Vec<Value>, Option<String>) {
        match self {
            PageResponse::Items(items) => (items, None),
            PageResponse::Envelope { items, next_link } => (items, next_link),
        }
    }
}

/// Error body returned with non-success statuses
#[derive(Debug, Deserialize, Default)]
pub struct ServiceErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ServiceErrorBody {
    /// Best human-readable description of the failure
    pub fn describe(&self) -> Option<String> {
        if let Some(message) = &self.message {
            return Some(message.clone());
        }
        match &self.error {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}
