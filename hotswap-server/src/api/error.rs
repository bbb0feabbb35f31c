//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::scheduler::QueueClosed;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<QueueClosed> for ApiError {
    fn from(err: QueueClosed) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
