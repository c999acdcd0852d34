use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The blob would not fit in the store's quota.
    #[error("blob of {size} bytes exceeds the {limit} byte quota")]
    QuotaExceeded { size: usize, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
}

impl StorageError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

impl From<StorageError> for padwatch_core::AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Database(e) => padwatch_core::AppError::Database(e.to_string()),
            StorageError::InvalidKey(_) => padwatch_core::AppError::InvalidInput(err.to_string()),
            other => padwatch_core::AppError::Storage(other.to_string()),
        }
    }
}
