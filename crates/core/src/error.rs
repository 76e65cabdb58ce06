// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Store unreachable after the connection retry budget was spent
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors surfaced synchronously by `QueueHandle::enqueue`
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("payload is not serializable: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("invalid job: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<crate::domain::DomainError> for EnqueueError {
    fn from(err: crate::domain::DomainError) -> Self {
        EnqueueError::Validation(err.to_string())
    }
}

// sqlx::Error conversion is handled in the infra-sqlite crate
// by converting to AppError::Database(String)
