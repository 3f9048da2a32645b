// crates/memvault-gateway/src/api/error.rs
// Uniform error responses for the HTTP API

use crate::error::GatewayError;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use memvault_types::{ErrorBody, ErrorCode, ErrorResponse};
use std::fmt;
use tracing::{error, warn};

/// Error as it leaves the API: a kind, a message and an HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn status_code(&self) -> StatusCode {
        status_for(self.code)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::ConnectionFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::ProtocolError => StatusCode::BAD_GATEWAY,
        ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let code = err.code();
        match code {
            ErrorCode::Internal | ErrorCode::StorageFailure | ErrorCode::ProtocolError => {
                error!(error = %err, "Request failed")
            }
            ErrorCode::ConnectionFailure | ErrorCode::DeadlineExceeded => {
                warn!(error = %err, "Request failed")
            }
            _ => {}
        }
        // Internal detail stays in the log
        let message = match &err {
            GatewayError::Internal(_) => "internal error".to_string(),
            GatewayError::Db(_) => "storage failure".to_string(),
            _ => err.to_string(),
        };
        Self { code, message }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                retryable: self.code.is_retryable(),
            },
        };
        (status_for(self.code), Json(body)).into_response()
    }
}
