//! HTTP error responses.

use axum::extract::multipart::MultipartError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use wfm_protocol::ErrorCode;

use crate::auth::{AuthError, REALM};
use crate::files::{BatchError, FileError};

/// Anything a request can fail with.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("multipart: {0}")]
    Multipart(#[from] MultipartError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn file_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AccessDenied | ErrorCode::ReadOnly => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists => StatusCode::CONFLICT,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Banned => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::WriteIntegrity | ErrorCode::CrossDevice | ErrorCode::Io | ErrorCode::Config => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl HttpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::File(e) => file_status(e.code()),
            Self::Batch(e) => file_status(e.file_error().code()),
            Self::Auth(AuthError::Banned(_)) => StatusCode::TOO_MANY_REQUESTS,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Multipart(e) => e.status(),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::File(e) => e.code(),
            Self::Batch(e) => e.file_error().code(),
            Self::Auth(AuthError::Banned(_)) => ErrorCode::Banned,
            Self::Auth(_) => ErrorCode::Unauthorized,
            Self::Multipart(_) | Self::BadRequest(_) => ErrorCode::InvalidRequest,
            Self::Internal(_) => ErrorCode::Io,
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    /// Present when a batch stopped part way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchDetail>,
}

/// Where a batch stopped.
#[derive(Debug, Serialize)]
pub struct BatchDetail {
    pub op: &'static str,
    pub applied: Vec<String>,
    pub failed: String,
    pub remaining: Vec<String>,
}

/// `401` asking the browser for credentials.
pub fn challenge() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "authentication required\n").into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{REALM}\"")) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        if matches!(&self, HttpError::Auth(e) if e.wants_challenge()) {
            return challenge();
        }

        let batch = match &self {
            HttpError::Batch(BatchError::Stopped(failure)) => Some(BatchDetail {
                op: failure.op,
                applied: failure.applied.clone(),
                failed: failure.failed.clone(),
                remaining: failure.remaining.clone(),
            }),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                batch,
            },
        };
        (status, Json(body)).into_response()
    }
}
