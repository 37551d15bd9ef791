use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no authenticated account")]
    AuthAbsent,

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unusable snapshot: {0}")]
    Format(String),

    #[error("reconciliation failed for {failed} of {total} patterns")]
    PartialBatch { failed: usize, total: usize },

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether the failure is worth another attempt later. `NotFound` covers
    /// local records that may still appear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Storage(_)
                | SyncError::Io(_)
                | SyncError::NotFound(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => SyncError::Storage(format!("HTTP {status}: {value}")),
            None => SyncError::Network(value.to_string()),
        }
    }
}
