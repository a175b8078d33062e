//! HTTP error responses.
//!
//! Every user-visible failure is a JSON `{error, message}` body; `error` is
//! the canonical reason phrase for the status code.

use crate::service::ConvertError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self
            .status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();
        let message = if self.message.is_empty() {
            error.clone()
        } else {
            self.message
        };
        (self.status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<ConvertError> for ApiError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::UnsupportedExtension => ApiError::bad_request(err.to_string()),
            ConvertError::IdempotencyReuse => ApiError::bad_request(err.to_string()),
            ConvertError::UnusableReplay(_) => ApiError::conflict(err.to_string()),
            ConvertError::Internal(e) => {
                tracing::error!(error = %e, "convert failed");
                ApiError::internal("cannot create conversion task")
            }
        }
    }
}
