//! Mapping of agent errors to HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::models::{ErrorResponse, ValidationErrorResponse};
use crate::dispatcher::DispatchError;
use crate::failover::FailoverError;

/// Errors returned by the agent's HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Validation(Vec<String>),
    Internal { message: String, code: &'static str },
}

impl ApiError {
    pub fn internal(message: impl Into<String>, code: &'static str) -> Self {
        ApiError::Internal {
            message: message.into(),
            code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid message authentication".to_string(),
                    code: Some("UNAUTHORIZED".to_string()),
                }),
            )
                .into_response(),
            ApiError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, Json(ValidationErrorResponse { errors })).into_response()
            }
            ApiError::Internal { message, code } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: message,
                    code: Some(code.to_string()),
                }),
            )
                .into_response(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Unauthorized => ApiError::Unauthorized,
            DispatchError::Encrypt(_) => ApiError::internal("Internal server error", "INTERNAL_ERROR"),
        }
    }
}

impl From<FailoverError> for ApiError {
    fn from(e: FailoverError) -> Self {
        match e {
            FailoverError::Validation(errors) => ApiError::Validation(errors),
            FailoverError::Disabled => ApiError::internal(
                "Manual failover failed: failover is not enabled",
                "FAILOVER_DISABLED",
            ),
            FailoverError::Persistence(e) => ApiError::internal(
                format!("Failed to apply failover configuration: {}", e),
                "PERSISTENCE_FAILED",
            ),
            e @ (FailoverError::Remap(_) | FailoverError::NothingSwitched { .. }) => {
                ApiError::internal(format!("Manual failover failed: {}", e), "FAILOVER_FAILED")
            }
        }
    }
}
