use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("LLM provider error: {0}")]
    Llm(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Validation error on field '{field}': {message}")]
    InvalidField { field: String, message: String },
    #[error("Authentication required: {0}")]
    Unauthenticated(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Stable error code used by the HTTP error envelope and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidField { .. } => "VALIDATION",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Llm(_) | Self::DependencyUnavailable(_) => "DEPENDENCY_UNAVAILABLE",
            Self::Database(_) | Self::Join(_) | Self::Io(_) | Self::InternalError(_) => "INTERNAL",
        }
    }
}
