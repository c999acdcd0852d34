use thiserror::Error;

/// Service-level error every padwatch crate converts into at its outer edge.
///
/// The variants are failure classes, not sources: a caller decides whether to
/// retry or report from the variant alone.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed address, unknown event name, bad filter value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the current lifecycle state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network-level chain failure; the same request may succeed later.
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ChainUnavailable(_) | AppError::Database(_))
    }

    /// Whether the caller, not the system, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_) | AppError::NotFound(_) | AppError::Conflict(_)
        )
    }
}
