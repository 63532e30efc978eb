//! HTTP handlers for memos-api.
//!
//! Handlers translate requests into service calls; all rules live in
//! [`crate::services`].

pub mod attachments;
pub mod memos;
pub mod uploads;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use memos_core::{Attachment, Memo};

use crate::ApiError;

/// Header carrying the authenticated user id, set by the fronting proxy.
pub const VIEWER_HEADER: &str = "x-memos-user";

/// The acting user; `None` for anonymous requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer(pub Option<i64>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(VIEWER_HEADER) else {
            return Ok(Viewer(None));
        };
        value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(|id| Viewer(Some(id)))
            .ok_or_else(|| ApiError::BadRequest(format!("invalid {} header", VIEWER_HEADER)))
    }
}

/// Memo with its resource name.
#[derive(Debug, Serialize)]
pub struct MemoView {
    pub name: String,
    #[serde(flatten)]
    pub memo: Memo,
}

impl From<Memo> for MemoView {
    fn from(memo: Memo) -> Self {
        Self {
            name: memo.name(),
            memo,
        }
    }
}

/// Attachment with its resource name.
#[derive(Debug, Serialize)]
pub struct AttachmentView {
    pub name: String,
    #[serde(flatten)]
    pub attachment: Attachment,
}

impl From<Attachment> for AttachmentView {
    fn from(attachment: Attachment) -> Self {
        Self {
            name: attachment.name(),
            attachment,
        }
    }
}

/// Liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
