use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// API Error with rich context and automatic error trait implementations
///
/// Design: Uses thiserror for ergonomic error handling with context.
/// Each variant carries meaningful context to help with debugging.
#[derive(Error, Debug)]
pub enum ApiError {
    // Authentication errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Request quota exceeded: {0}")]
    QuotaExceeded(String),

    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Query {query_id} not found")]
    QueryNotFound { query_id: String },

    // Validation errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid sort column '{column}': valid columns are {valid}")]
    InvalidSortColumn { column: String, valid: String },

    // Warehouse errors
    #[error("Warehouse connection failed: {0}")]
    WarehouseConnectionFailed(String),

    #[error("Warehouse query timeout")]
    WarehouseTimeout,

    #[error("Warehouse error: {0}")]
    WarehouseError(String),

    // Prompt assembly errors surface as-is; they are never retried
    #[error("Prompt assembly failed: {0}")]
    Assembly(String),

    // System errors
    #[error("Internal error: {0}")]
    InternalError(String),

    // Database errors - auto-convert from sqlx::Error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Helper to create unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Helper to create forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Helper to create not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Helper to create validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Helper to create warehouse connection failed error
    pub fn warehouse_connection_failed(message: impl Into<String>) -> Self {
        Self::WarehouseConnectionFailed(message.into())
    }

    /// Helper to create internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::SessionNotFound { .. } | Self::QueryNotFound { .. } => {
                StatusCode::NOT_FOUND
            },
            Self::ValidationError(_) | Self::InvalidSortColumn { .. } => StatusCode::BAD_REQUEST,
            Self::WarehouseTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::WarehouseConnectionFailed(_)
            | Self::WarehouseError(_)
            | Self::Assembly(_)
            | Self::InternalError(_)
            | Self::Database(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body sent to clients. No stack traces, no internals.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal failure detail stays in the logs
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {:?}", self);
        } else {
            tracing::debug!("Request failed ({}): {}", status, self);
        }

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::unauthorized("x").status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::QuotaExceeded("daily".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::SessionNotFound { session_id: "s1".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::validation("bad").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::WarehouseTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::internal_error("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_invalid_sort_column_message() {
        let err = ApiError::InvalidSortColumn {
            column: "nonexistent".into(),
            valid: "user_id, user_name".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nonexistent"));
        assert!(msg.contains("user_id, user_name"));
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = ApiError::internal_error("secret pool address");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
