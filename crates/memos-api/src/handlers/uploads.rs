//! Resumable upload HTTP handlers.
//!
//! Local sessions are filled with `PATCH` requests carrying the chunk as the
//! raw body and the client's offset in `Upload-Offset`. Every progress
//! response echoes the authoritative offset in the same header.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use memos_core::{CreateUploadSession, UploadSessionProgress};

use super::{AttachmentView, Viewer};
use crate::error::UPLOAD_OFFSET_HEADER;
use crate::services::UploadTicket;
use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct UploadSessionResponse {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_name: Option<String>,
    pub progress: UploadSessionProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

impl From<UploadTicket> for UploadSessionResponse {
    fn from(ticket: UploadTicket) -> Self {
        Self {
            id: ticket.session.id,
            filename: ticket.session.filename,
            content_type: ticket.session.content_type,
            size: ticket.session.size,
            memo_name: ticket.session.memo_name,
            progress: ticket.progress,
            upload_url: ticket.upload_url,
        }
    }
}

/// Request for a presigned multipart part URL.
#[derive(Debug, Deserialize)]
pub struct PartUploadRequest {
    pub expected_offset: i64,
    pub part_number: i32,
    pub size: i64,
}

fn progress_response(progress: UploadSessionProgress) -> Response {
    let offset = HeaderValue::from(progress.received_size);
    let mut response = Json(progress).into_response();
    response.headers_mut().insert(UPLOAD_OFFSET_HEADER, offset);
    response
}

fn upload_offset(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get(UPLOAD_OFFSET_HEADER)
        .ok_or_else(|| ApiError::BadRequest("missing Upload-Offset header".into()))?
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .ok_or_else(|| ApiError::BadRequest("invalid Upload-Offset header".into()))
}

/// Open an upload session.
///
/// # Returns
/// - 201 Created with the session, its progress and, for S3 direct
///   sessions, the presigned PUT URL
/// - 400 Bad Request when the declared size is not positive or over the limit
pub async fn create_upload_session(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Json(req): Json<CreateUploadSession>,
) -> Result<(StatusCode, Json<UploadSessionResponse>), ApiError> {
    let ticket = state.attachments.create_upload_session(viewer, req).await?;
    Ok((StatusCode::CREATED, Json(ticket.into())))
}

pub async fn get_upload_progress(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let progress = state
        .attachments
        .get_upload_session_progress(viewer, &id)
        .await?;
    Ok(progress_response(progress))
}

/// Append a chunk at `Upload-Offset`.
///
/// # Returns
/// - 200 OK with the new progress
/// - 409 Conflict with the current offset when `Upload-Offset` is stale
pub async fn append_upload_chunk(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let offset = upload_offset(&headers)?;
    let progress = state
        .attachments
        .append_upload_chunk(viewer, &id, offset, body)
        .await?;
    Ok(progress_response(progress))
}

pub async fn upload_thumbnail(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state
        .attachments
        .upload_session_thumbnail(viewer, &id, body)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_part_upload_url(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
    Json(req): Json<PartUploadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let part = state
        .attachments
        .create_multipart_part_upload_url(viewer, &id, req.expected_offset, req.part_number, req.size)
        .await?;
    Ok(Json(serde_json::json!({
        "upload_url": part.upload_url,
        "part_number": part.part_number,
        "offset": part.offset,
        "size": part.size,
    })))
}

pub async fn complete_upload_session(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AttachmentView>), ApiError> {
    let attachment = state
        .attachments
        .complete_upload_session(viewer, &id)
        .await?;
    Ok((StatusCode::CREATED, Json(attachment.into())))
}

pub async fn cancel_upload_session(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.attachments.cancel_upload_session(viewer, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
