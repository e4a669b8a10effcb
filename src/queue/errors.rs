use std::path::PathBuf;
use thiserror::Error;
use super::types::TaskStatus;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Local storage unavailable at {path}: {message}")]
    StorageUnavailable {
        path: PathBuf,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record {id} is {size} bytes, limit is {limit}")]
    RecordTooLarge {
        id: String,
        size: usize,
        limit: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Transfer timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },

    #[error("Cannot {action} task in state {from}")]
    InvalidStateTransition {
        action: &'static str,
        from: TaskStatus,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Queue manager shut down")]
    ManagerShutdown,
}

impl QueueError {
    pub fn storage_unavailable(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
