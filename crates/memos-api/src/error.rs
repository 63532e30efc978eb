//! HTTP mapping of service errors.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// Header carrying the authoritative offset of a resumable upload.
pub const UPLOAD_OFFSET_HEADER: &str = "upload-offset";

#[derive(Debug)]
pub enum ApiError {
    Internal(memos_core::Error),
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    /// Upload state conflict; the client resumes from `current`.
    Conflict { message: String, current: i64, size: Option<i64> },
}

impl From<memos_core::Error> for ApiError {
    fn from(err: memos_core::Error) -> Self {
        use memos_core::Error;

        if err.is_validation() {
            return ApiError::BadRequest(err.to_string());
        }
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Unauthenticated(msg) => ApiError::Unauthorized(msg),
            Error::OffsetMismatch { current, .. } => ApiError::Conflict {
                message: err.to_string(),
                current,
                size: None,
            },
            Error::UploadIncomplete { received, size } => ApiError::Conflict {
                message: err.to_string(),
                current: received,
                size: Some(size),
            },
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, offset) = match self {
            ApiError::Internal(err) => {
                error!(subsystem = "api", error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": err.to_string() }),
                    None,
                )
            }
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, serde_json::json!({ "error": msg }), None)
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg }), None)
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }), None)
            }
            ApiError::Conflict {
                message,
                current,
                size,
            } => {
                let mut body = serde_json::json!({
                    "error": message,
                    "current_offset": current,
                });
                if let Some(size) = size {
                    body["size"] = serde_json::json!(size);
                }
                (StatusCode::CONFLICT, body, Some(current))
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(offset) = offset {
            response
                .headers_mut()
                .insert(UPLOAD_OFFSET_HEADER, HeaderValue::from(offset));
        }
        response
    }
}
