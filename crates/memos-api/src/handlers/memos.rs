//! Memo HTTP handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use memos_core::{CreateMemo, MemoState, UpdateMemo};

use super::{MemoView, Viewer};
use crate::{ApiError, AppState};

/// Query parameters for listing memos.
#[derive(Debug, Default, Deserialize)]
pub struct ListMemosQuery {
    /// CEL filter expression.
    #[serde(default)]
    pub filter: String,
    /// `NORMAL` (default) or `ARCHIVED`.
    pub state: Option<String>,
    #[serde(default)]
    pub page_size: i32,
    #[serde(default)]
    pub page_token: String,
}

/// Query parameters for incremental sync.
#[derive(Debug, Deserialize)]
pub struct MemoChangesQuery {
    /// Exclusive lower bound; the previous response's `sync_anchor`.
    #[serde(default = "epoch")]
    pub since: DateTime<Utc>,
    /// Inclusive upper bound; defaults to now.
    pub sync_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filter: String,
    pub state: Option<String>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn parse_state(state: Option<&str>) -> Result<Option<MemoState>, ApiError> {
    match state.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => MemoState::parse(&s.to_ascii_uppercase())
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid state: {}", s))),
    }
}

#[derive(Debug, Serialize)]
pub struct MemoPageResponse {
    pub memos: Vec<MemoView>,
    pub next_page_token: String,
}

#[derive(Debug, Serialize)]
pub struct MemoChangesResponse {
    pub memos: Vec<MemoView>,
    pub deleted_memo_names: Vec<String>,
    pub sync_anchor: DateTime<Utc>,
}

/// List memos visible to the viewer.
///
/// # Returns
/// - 200 OK with a page of memos and the next page token (empty on the last page)
/// - 400 Bad Request for an invalid filter, state or page token
pub async fn list_memos(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Query(query): Query<ListMemosQuery>,
) -> Result<Json<MemoPageResponse>, ApiError> {
    let memo_state = parse_state(query.state.as_deref())?;
    let page = state
        .memos
        .list_memos(
            viewer,
            memo_state,
            &query.filter,
            query.page_size,
            &query.page_token,
        )
        .await?;
    Ok(Json(MemoPageResponse {
        memos: page.memos.into_iter().map(MemoView::from).collect(),
        next_page_token: page.next_page_token,
    }))
}

/// Memos changed or removed for the viewer in `(since, sync_anchor]`.
pub async fn list_memo_changes(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Query(query): Query<MemoChangesQuery>,
) -> Result<Json<MemoChangesResponse>, ApiError> {
    let memo_state = parse_state(query.state.as_deref())?;
    let changes = state
        .memos
        .list_memo_changes(
            viewer,
            memo_state,
            &query.filter,
            query.since,
            query.sync_anchor,
        )
        .await?;
    Ok(Json(MemoChangesResponse {
        memos: changes.memos.into_iter().map(MemoView::from).collect(),
        deleted_memo_names: changes.deleted_memo_names,
        sync_anchor: changes.sync_anchor,
    }))
}

pub async fn create_memo(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Json(req): Json<CreateMemo>,
) -> Result<(StatusCode, Json<MemoView>), ApiError> {
    let memo = state.memos.create_memo(viewer, req).await?;
    Ok((StatusCode::CREATED, Json(memo.into())))
}

pub async fn get_memo(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
) -> Result<Json<MemoView>, ApiError> {
    let memo = state.memos.get_memo(viewer, &uid).await?;
    Ok(Json(memo.into()))
}

pub async fn update_memo(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
    Json(req): Json<UpdateMemo>,
) -> Result<Json<MemoView>, ApiError> {
    let memo = state.memos.update_memo(viewer, &uid, req).await?;
    Ok(Json(memo.into()))
}

pub async fn delete_memo(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(uid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.memos.delete_memo(viewer, &uid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tag histogram of a user's memos as seen by the viewer.
pub async fn get_user_tag_count(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state.memos.get_user_tag_count(user_id, viewer).await?;
    Ok(Json(serde_json::json!({ "tag_count": counts })))
}
