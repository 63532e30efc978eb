//! Memo query and sync engine.
//!
//! Listing and sync share one pipeline: compile the filter, fetch candidates
//! visible to the viewer under the derived SQL prefilter, then apply the
//! exact predicate in process. Listing caps the candidate set and paginates
//! the filtered result; sync returns the complete update window.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use memos_core::defaults::{MAX_PAGE_SIZE, MEMO_CANDIDATE_LIMIT, PAGE_SIZE, UID_LENGTH};
use memos_core::filter::references_content_fields;
use memos_core::tags::removed_collaborators;
use memos_core::{
    normalize_tags, properties, CompiledFilter, CreateMemo, Error, Memo, MemoChanges, MemoPage,
    MemoState, NewMemo, Result, UpdateMemo, Visibility,
};
use memos_db::{now_micros, Database, MemoOrder, MemoQuery};

use super::random_id;

#[derive(Clone)]
pub struct MemoService {
    db: Database,
}

/// Compile a user filter, rejecting content-driven filters first.
fn compile_filter(raw: &str) -> Result<CompiledFilter> {
    if references_content_fields(raw) {
        return Err(Error::InvalidFilter(
            "filtering on content or content properties is not supported".into(),
        ));
    }
    CompiledFilter::compile(raw)
}

/// Decode an opaque page token into a row offset.
fn parse_page_token(token: &str) -> Result<usize> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse::<usize>()
        .map_err(|_| Error::InvalidPageToken(token.to_string()))
}

fn clamp_page_size(page_size: i32) -> usize {
    if page_size <= 0 {
        PAGE_SIZE as usize
    } else {
        page_size.min(MAX_PAGE_SIZE) as usize
    }
}

impl MemoService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list_memos(
        &self,
        viewer: Option<i64>,
        state: Option<MemoState>,
        raw_filter: &str,
        page_size: i32,
        page_token: &str,
    ) -> Result<MemoPage> {
        let start = Instant::now();
        let filter = compile_filter(raw_filter)?;
        let offset = parse_page_token(page_token)?;
        let page_size = clamp_page_size(page_size);

        let mut query = MemoQuery::new(viewer, filter.sql_prefilter());
        query.state = Some(state.unwrap_or(MemoState::Normal));
        query.order = MemoOrder::CreatedDesc;
        query.limit = Some(MEMO_CANDIDATE_LIMIT);
        let candidates = self.db.memos.list(&query).await?;
        let candidate_count = candidates.len();

        let now = Utc::now().timestamp();
        let matched: Vec<Memo> = candidates
            .into_iter()
            .filter(|m| filter.matches_at(m, now))
            .collect();
        let total = matched.len();

        let memos: Vec<Memo> = matched.into_iter().skip(offset).take(page_size).collect();
        let next_page_token = if offset.saturating_add(page_size) < total {
            (offset + page_size).to_string()
        } else {
            String::new()
        };

        debug!(
            subsystem = "memos",
            op = "list_memos",
            viewer_id = ?viewer,
            candidate_count,
            result_count = memos.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Listed memos"
        );
        Ok(MemoPage {
            memos,
            next_page_token,
        })
    }

    /// Incremental sync window `(since, sync_anchor]`.
    ///
    /// Changed memos are returned oldest update first with no cap, so a
    /// client may advance its cursor to the last memo it consumed.
    pub async fn list_memo_changes(
        &self,
        viewer: Option<i64>,
        state: Option<MemoState>,
        raw_filter: &str,
        since: DateTime<Utc>,
        sync_anchor: Option<DateTime<Utc>>,
    ) -> Result<MemoChanges> {
        let viewer_id =
            viewer.ok_or_else(|| Error::Unauthenticated("sync requires a signed-in user".into()))?;
        let filter = compile_filter(raw_filter)?;

        let anchor = match sync_anchor {
            Some(anchor) if anchor.timestamp_micros() > 0 => anchor,
            _ => now_micros(),
        };
        let since = since.min(anchor);

        let mut query = MemoQuery::new(viewer, filter.sql_prefilter());
        query.state = Some(state.unwrap_or(MemoState::Normal));
        query.updated_after = Some(since);
        query.updated_until = Some(anchor);
        query.order = MemoOrder::UpdatedAsc;
        let now = Utc::now().timestamp();
        let memos: Vec<Memo> = self
            .db
            .memos
            .list(&query)
            .await?
            .into_iter()
            .filter(|m| filter.matches_at(m, now))
            .collect();

        let deleted_memo_names = self
            .db
            .memo_changes
            .list_removed_memo_names(viewer_id, since, anchor)
            .await?;

        debug!(
            subsystem = "memos",
            op = "list_memo_changes",
            viewer_id,
            result_count = memos.len(),
            deleted = deleted_memo_names.len(),
            "Computed sync window"
        );
        Ok(MemoChanges {
            memos,
            deleted_memo_names,
            sync_anchor: anchor,
        })
    }

    /// Tag histogram of `requested_user`'s NORMAL memos visible to `viewer`.
    pub async fn get_user_tag_count(
        &self,
        requested_user: i64,
        viewer: Option<i64>,
    ) -> Result<BTreeMap<String, i64>> {
        self.db.memos.tag_counts(requested_user, viewer).await
    }

    pub async fn create_memo(&self, viewer: Option<i64>, req: CreateMemo) -> Result<Memo> {
        let creator_id = viewer
            .ok_or_else(|| Error::Unauthenticated("creating a memo requires a user".into()))?;
        if let Some(location) = &req.location {
            location.validate()?;
        }

        let memo = self
            .db
            .memos
            .insert(NewMemo {
                uid: random_id(UID_LENGTH),
                creator_id,
                property: properties::extract(&req.content),
                content: req.content,
                visibility: req.visibility.unwrap_or(Visibility::Private),
                state: MemoState::Normal,
                pinned: req.pinned,
                tags: normalize_tags(&req.tags),
                location: req.location,
            })
            .await?;

        info!(
            subsystem = "memos",
            op = "create_memo",
            memo_id = memo.id,
            viewer_id = creator_id,
            "Created memo"
        );
        Ok(memo)
    }

    /// A memo the viewer may see; invisible memos are reported as missing.
    pub async fn get_memo(&self, viewer: Option<i64>, uid: &str) -> Result<Memo> {
        match self.db.memos.get_by_uid(uid).await? {
            Some(memo) if memo.is_visible_to(viewer) => Ok(memo),
            _ => Err(Error::NotFound(format!("memo {}", uid))),
        }
    }

    /// A memo the viewer may edit or delete.
    async fn get_modifiable(&self, viewer: Option<i64>, uid: &str) -> Result<(i64, Memo)> {
        let viewer_id =
            viewer.ok_or_else(|| Error::Unauthenticated("modifying a memo requires a user".into()))?;
        match self.db.memos.get_by_uid(uid).await? {
            Some(memo) if memo.can_modify(viewer_id) => Ok((viewer_id, memo)),
            _ => Err(Error::NotFound(format!("memo {}", uid))),
        }
    }

    /// Apply a partial update. Collaborators dropped from the tag set are
    /// told through a `VISIBILITY_REVOKED` event.
    pub async fn update_memo(
        &self,
        viewer: Option<i64>,
        uid: &str,
        req: UpdateMemo,
    ) -> Result<Memo> {
        let (viewer_id, before) = self.get_modifiable(viewer, uid).await?;
        let mut memo = before.clone();

        if let Some(content) = req.content {
            memo.property = properties::extract(&content);
            memo.content = content;
        }
        if let Some(visibility) = req.visibility {
            memo.visibility = visibility;
        }
        if let Some(state) = req.state {
            memo.state = state;
        }
        if let Some(pinned) = req.pinned {
            memo.pinned = pinned;
        }
        if let Some(tags) = req.tags {
            memo.tags = normalize_tags(&tags);
        }
        if let Some(location) = req.location {
            if let Some(loc) = &location {
                loc.validate()?;
            }
            memo.location = location;
        }

        let revoked: Vec<i64> = removed_collaborators(&before.tags, &memo.tags)
            .into_iter()
            .filter(|id| *id != memo.creator_id)
            .collect();
        let updated = self.db.memos.update(&memo, &revoked).await?;

        info!(
            subsystem = "memos",
            op = "update_memo",
            memo_id = updated.id,
            viewer_id,
            revoked = revoked.len(),
            "Updated memo"
        );
        Ok(updated)
    }

    /// Hard delete, announced to the creator and every collaborator.
    pub async fn delete_memo(&self, viewer: Option<i64>, uid: &str) -> Result<()> {
        let (viewer_id, memo) = self.get_modifiable(viewer, uid).await?;
        let mut recipients = memo.collaborators();
        recipients.push(memo.creator_id);
        recipients.sort_unstable();
        recipients.dedup();

        self.db.memos.delete(&memo, &recipients).await?;
        info!(
            subsystem = "memos",
            op = "delete_memo",
            memo_id = memo.id,
            viewer_id,
            result_count = recipients.len(),
            "Deleted memo"
        );
        Ok(())
    }
}
