//! Error types for the table service provider

use bridge_traits::error::BridgeError;
use bridge_traits::remote::RemoteError;
use thiserror::Error;

/// Table service provider errors
#[derive(Error, Debug)]
pub enum TableServiceError {
    /// The configured base URL cannot address a table service
    #[error("Invalid service URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// A successful response did not have the expected shape
    #[error("Failed to parse service response (status {status}): {message}")]
    ParseError { status: u16, message: String },

    /// The request body could not be encoded
    #[error("Failed to encode request: {0}")]
    EncodeError(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for table service operations
pub type Result<T> = std::result::Result<T, TableServiceError>;

impl From<TableServiceError> for BridgeError {
    fn from(error: TableServiceError) -> Self {
        match error {
            TableServiceError::BridgeError(e) => e,
            other => BridgeError::OperationFailed(other.to_string()),
        }
    }
}

impl From<TableServiceError> for RemoteError {
    fn from(error: TableServiceError) -> Self {
        match error {
            TableServiceError::ParseError { status, message } => RemoteError::Permanent {
                status,
                message: format!("Malformed response: {}", message),
            },
            // Never reached the wire, so the same request may succeed later
            other => RemoteError::Transient {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TableServiceError::InvalidBaseUrl {
            url: "ftp://x".to_string(),
            reason: "unsupported scheme".to_string(),
        };

        assert_eq!(
            error.to_string(),
            "Invalid service URL 'ftp://x': unsupported scheme"
        );
    }

    #[test]
    fn test_error_conversion() {
        let error = TableServiceError::EncodeError("bad json".to_string());
        let bridge_error: BridgeError = error.into();
        assert!(matches!(bridge_error, BridgeError::OperationFailed(_)));

        let parse = TableServiceError::ParseError {
            status: 200,
            message: "expected array".to_string(),
        };
        let remote: RemoteError = parse.into();
        assert_eq!(remote.status(), Some(200));
        assert!(!remote.is_transient());
    }
}
