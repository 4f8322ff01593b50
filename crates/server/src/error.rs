//! HTTP error mapping.

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tidestream_core::StreamError;
use tracing::error;

/// Error returned by handlers, rendered as `{code, message}`.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "malformed-request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code,
            message: &self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        let status = match &err {
            StreamError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StreamError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            StreamError::AlreadyExists(_)
            | StreamError::AlreadyEnded { .. }
            | StreamError::StreamClosed { .. } => StatusCode::CONFLICT,
            StreamError::PoolExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            StreamError::Backend(e) => {
                error!(error = %e, "Backend failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            StreamError::Internal(message) => {
                error!(error = %message, "Internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", e.body_text())
            }
            other => Self::bad_request(other.body_text()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}
