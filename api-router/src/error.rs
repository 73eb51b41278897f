use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde_json::{json, Value};
use thiserror::Error;

/// Surface error of the HTTP layer. Serializes to the
/// `{error: {code, message, details?}}` envelope.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::DependencyUnavailable(_) => "DEPENDENCY_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::Unauthenticated(message)
            | Self::PermissionDenied(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::QuotaExceeded(message)
            | Self::DependencyUnavailable(message) => message.clone(),
            Self::Internal => "Internal server error".to_string(),
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Validation { details, .. } => details.clone(),
            _ => None,
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(message) => Self::Validation {
                message,
                details: None,
            },
            AppError::InvalidField { field, message } => Self::Validation {
                message: message.clone(),
                details: Some(json!({ "field": field })),
            },
            AppError::Unauthenticated(message) => Self::Unauthenticated(message),
            AppError::PermissionDenied(message) => Self::PermissionDenied(message),
            AppError::NotFound(message) => Self::NotFound(message),
            AppError::Conflict(message) => Self::Conflict(message),
            AppError::QuotaExceeded(message) => Self::QuotaExceeded(message),
            AppError::Llm(_) => {
                tracing::error!("LLM provider error: {:?}", err);
                Self::DependencyUnavailable("LLM provider unavailable".to_string())
            }
            AppError::DependencyUnavailable(message) => Self::DependencyUnavailable(message),
            AppError::Database(_) | AppError::Join(_) | AppError::Io(_) | AppError::InternalError(_) => {
                tracing::error!("Internal error: {:?}", err);
                Self::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code(),
            "message": self.message(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn status_codes_match_the_error_surface() {
        assert_eq!(
            status_of(ApiError::Validation {
                message: "bad".into(),
                details: None
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Unauthenticated("no".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(ApiError::PermissionDenied("no".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(ApiError::NotFound("gone".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::Conflict("dup".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::QuotaExceeded("limit".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ApiError::DependencyUnavailable("llm".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(ApiError::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let err = ApiError::from(AppError::InternalError("db password wrong".into()));
        assert_eq!(err.message(), "Internal server error");
    }

    #[test]
    fn invalid_field_carries_details() {
        let err = ApiError::from(AppError::InvalidField {
            field: "limit".into(),
            message: "out of range".into(),
        });
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(err.details(), Some(json!({ "field": "limit" })));
    }

    #[test]
    fn quota_and_permission_stay_distinct() {
        assert_eq!(
            ApiError::from(AppError::QuotaExceeded("runs".into())).code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(
            ApiError::from(AppError::PermissionDenied("case".into())).code(),
            "PERMISSION_DENIED"
        );
    }
}
