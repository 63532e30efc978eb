//! Attachment HTTP handlers.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use memos_core::CreateAttachment;

use super::{AttachmentView, Viewer};
use crate::services::{AttachmentContent, ByteRange};
use crate::{ApiError, AppState};

/// Query parameters of a file download.
#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    /// Serve the thumbnail when one exists.
    #[serde(default)]
    pub thumbnail: bool,
    /// Redirect to a presigned object-store URL when possible.
    #[serde(default)]
    pub redirect: bool,
}

pub async fn list_attachments(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
) -> Result<Json<serde_json::Value>, ApiError> {
    let attachments: Vec<AttachmentView> = state
        .attachments
        .list_attachments(viewer)
        .await?
        .into_iter()
        .map(AttachmentView::from)
        .collect();
    Ok(Json(serde_json::json!({ "attachments": attachments })))
}

/// Upload an attachment inline as base64.
///
/// # Returns
/// - 201 Created with the attachment
/// - 400 Bad Request for invalid base64 or a payload over the size limit
pub async fn create_attachment(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Json(req): Json<CreateAttachment>,
) -> Result<(StatusCode, Json<AttachmentView>), ApiError> {
    let attachment = state.attachments.create_attachment(viewer, req).await?;
    Ok((StatusCode::CREATED, Json(attachment.into())))
}

pub async fn get_attachment(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
) -> Result<Json<AttachmentView>, ApiError> {
    let attachment = state.attachments.get_attachment(viewer, &uid).await?;
    Ok(Json(attachment.into()))
}

pub async fn delete_attachment(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.attachments.delete_attachment(viewer, &uid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream attachment bytes, honouring a single `Range`.
pub async fn download_attachment(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))
                .and_then(|s| ByteRange::parse(s).map_err(ApiError::from))
        })
        .transpose()?;

    let content = state
        .attachments
        .open_attachment(viewer, &uid, range, query.thumbnail, query.redirect)
        .await?;

    let (filename, content_type, total_size, range, reader) = match content {
        AttachmentContent::Redirect(url) => return Ok(Redirect::temporary(&url).into_response()),
        AttachmentContent::Stream {
            filename,
            content_type,
            total_size,
            range,
            reader,
        } => (filename, content_type, total_size, range, reader),
    };

    let (status, length) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, end - start + 1),
        None => (StatusCode::OK, total_size),
    };
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| ApiError::Internal(memos_core::Error::Internal(e.to_string())))?;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some((start, end)) = range {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total_size)) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// Inline disposition with a header-safe filename.
fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("inline; filename=\"{}\"", safe)
}
