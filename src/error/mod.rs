//! Centralized error handling for the koboloan engine.
//!
//! Two layers: [`EngineError`] classifies failures the orchestration logic
//! branches on (gateway transport vs. declined vs. invariant violation),
//! and [`ApiError`] maps errors onto HTTP responses for the thin admin
//! surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;

/// Failure classes inside the loan lifecycle engine.
///
/// The distinction between `Transport` and `Declined` is load-bearing: a
/// transport failure carries no outcome and is deferred to reconciliation,
/// while a decline is a definitive gateway answer recorded on the
/// transaction.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gateway transport failure: {0}")]
    Transport(String),

    #[error("gateway declined: code {code}")]
    Declined { code: String, message: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Money moved but the provider-side loan status could not be updated.
    /// Surfaced to operators, deliberately not auto-retried.
    #[error("gateway status update failed for loan {loan_id}: {reason}")]
    StatusUpdate { loan_id: Uuid, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True when the failure carries no gateway outcome and the transaction
    /// must be resolved by reconciliation.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }

    /// True when retrying the same operation can succeed: the gateway was
    /// unreachable, or a concurrent writer won a version race.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Conflict(_))
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transport(msg) => EngineError::Transport(msg),
            // An auth failure means the dependent call never reached the
            // provider; no outcome exists, so it reconciles like transport.
            GatewayError::Auth(msg) => EngineError::Transport(format!("auth: {}", msg)),
        }
    }
}

/// API error type with HTTP status code mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::DatabaseError(_) => "DATABASE_ERROR",
            ApiError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::InternalError(_)
            | ApiError::DatabaseError(_)
            | ApiError::ExternalServiceError(_) => {
                tracing::error!(error = %message, code = %error_code, "Server error occurred");
            }
            _ => {
                tracing::debug!(error = %message, code = %error_code, "Client error occurred");
            }
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code: error_code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => ApiError::NotFound(msg),
            EngineError::Invariant(msg) => ApiError::UnprocessableEntity(msg),
            EngineError::Conflict(msg) => ApiError::Conflict(msg),
            EngineError::Transport(msg) => ApiError::ExternalServiceError(msg),
            EngineError::Declined { code, message } => {
                ApiError::UnprocessableEntity(format!("gateway declined ({}): {}", code, message))
            }
            EngineError::StatusUpdate { loan_id, reason } => ApiError::ExternalServiceError(
                format!("status update failed for loan {}: {}", loan_id, reason),
            ),
            EngineError::Database(e) => ApiError::DatabaseError(e.to_string()),
            EngineError::Other(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::DatabaseError(err.to_string()),
        }
    }
}

/// Result type alias using ApiError
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ApiError::BadRequest("test".to_string()).error_code(),
            "BAD_REQUEST"
        );
        assert_eq!(
            ApiError::ExternalServiceError("test".to_string()).error_code(),
            "EXTERNAL_SERVICE_ERROR"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::ExternalServiceError("test".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::InternalError("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transport_classification() {
        let err: EngineError = GatewayError::Transport("timeout".to_string()).into();
        assert!(err.is_transport());

        let err: EngineError = GatewayError::Auth("bad credentials".to_string()).into();
        assert!(err.is_transport());

        let err = EngineError::Declined {
            code: "51".to_string(),
            message: "insufficient funds".to_string(),
        };
        assert!(!err.is_transport());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Transport("timeout".to_string()).is_retryable());

        let conflict = EngineError::Conflict("loan version moved".to_string());
        assert!(conflict.is_retryable());
        assert!(!conflict.is_transport());

        assert!(!EngineError::NotFound("gone".to_string()).is_retryable());
    }

    #[test]
    fn test_engine_to_api_mapping() {
        let api: ApiError = EngineError::Invariant("already covered".to_string()).into();
        assert_eq!(api.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let api: ApiError = EngineError::Transport("timeout".to_string()).into();
        assert_eq!(api.status_code(), StatusCode::BAD_GATEWAY);
    }
}
