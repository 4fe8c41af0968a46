use bridge_traits::error::BridgeError;
use bridge_traits::remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid entity in table {table}: {reason}")]
    InvalidEntity { table: String, reason: String },

    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("Table {0} is not registered")]
    UnknownTable(String),

    #[error("No pull query named {0}")]
    UnknownQuery(String),

    #[error("Item {id} not found in table {table}")]
    ItemNotFound { table: String, id: String },

    #[error("Item {id} already exists in table {table}")]
    ItemAlreadyExists { table: String, id: String },

    #[error("Invalid operation sequence for {table}/{id}: {reason}")]
    InvalidOperationSequence {
        table: String,
        id: String,
        reason: String,
    },

    #[error("Table {table} has {count} pending operations")]
    PendingOperations { table: String, count: u64 },

    #[error("Pending operation {0} not found")]
    OperationNotFound(u64),

    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Remote error (status {status:?}): {message}")]
    Remote { status: Option<u16>, message: String },

    #[error("Push pipeline stage {stage} failed: {message}")]
    Pipeline { stage: String, message: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Whether retrying the same cycle later can succeed without intervention
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Cancelled)
    }
}

impl From<BridgeError> for SyncError {
    fn from(error: BridgeError) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Transient { message, .. } => SyncError::Transient(message),
            RemoteError::Unauthorized { message, .. } => SyncError::Unauthorized(message),
            RemoteError::Permanent { status, message } => SyncError::Remote {
                status: Some(status),
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
