//! Memo repository.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use memos_core::{
    Error, Location, Memo, MemoChangeEventType, MemoProperty, MemoSqlPrefilter, MemoState,
    NewMemo, Result, Visibility,
};

use crate::memo_changes::insert_event_tx;
use crate::memo_filter::{bind_params, visibility_clause, MemoFilterQueryBuilder, QueryParam};
use crate::{from_micros, now_micros, to_micros};

const MEMO_COLUMNS: &str = "m.id, m.uid, m.creator_id, m.content, m.visibility, m.row_status, \
     m.pinned, m.tags, m.location, m.has_link, m.has_task_list, m.has_code, \
     m.has_incomplete_tasks, m.created_ts, m.updated_ts";

/// Result ordering of a candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoOrder {
    /// Newest creation first (listing).
    CreatedDesc,
    /// Oldest update first (sync).
    UpdatedAsc,
}

/// Candidate query combining visibility, state, prefilter and an optional
/// update-time window `(updated_after, updated_until]`.
#[derive(Debug, Clone)]
pub struct MemoQuery<'a> {
    pub viewer: Option<i64>,
    pub state: Option<MemoState>,
    pub prefilter: &'a MemoSqlPrefilter,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_until: Option<DateTime<Utc>>,
    pub order: MemoOrder,
    pub limit: Option<i64>,
}

impl<'a> MemoQuery<'a> {
    pub fn new(viewer: Option<i64>, prefilter: &'a MemoSqlPrefilter) -> Self {
        Self {
            viewer,
            state: None,
            prefilter,
            updated_after: None,
            updated_until: None,
            order: MemoOrder::CreatedDesc,
            limit: None,
        }
    }

    /// Render the full SELECT and its parameters.
    fn to_sql(&self) -> (String, Vec<QueryParam>) {
        let (visibility_sql, mut params) = visibility_clause(self.viewer);
        let mut clauses = vec![visibility_sql];

        if let Some(state) = self.state {
            clauses.push("m.row_status = ?".to_string());
            params.push(QueryParam::String(state.as_str().to_string()));
        }
        if let Some(after) = self.updated_after {
            clauses.push("m.updated_ts > ?".to_string());
            params.push(QueryParam::Int(to_micros(after)));
        }
        if let Some(until) = self.updated_until {
            clauses.push("m.updated_ts <= ?".to_string());
            params.push(QueryParam::Int(to_micros(until)));
        }

        let (filter_sql, filter_params) = MemoFilterQueryBuilder::new(self.prefilter).build();
        if filter_sql != "1" {
            clauses.push(filter_sql);
            params.extend(filter_params);
        }

        let order = match self.order {
            MemoOrder::CreatedDesc => "m.created_ts DESC, m.id DESC",
            MemoOrder::UpdatedAsc => "m.updated_ts ASC, m.id ASC",
        };
        let mut sql = format!(
            "SELECT {} FROM memo m WHERE {} ORDER BY {}",
            MEMO_COLUMNS,
            clauses.join(" AND "),
            order
        );
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(QueryParam::Int(limit));
        }
        (sql, params)
    }
}

fn memo_from_row(row: &SqliteRow) -> Result<Memo> {
    let visibility: String = row.try_get("visibility")?;
    let state: String = row.try_get("row_status")?;
    let tags: String = row.try_get("tags")?;
    let location: Option<String> = row.try_get("location")?;

    Ok(Memo {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        creator_id: row.try_get("creator_id")?,
        content: row.try_get("content")?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| Error::Internal(format!("unknown visibility: {}", visibility)))?,
        state: MemoState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("unknown memo state: {}", state)))?,
        pinned: row.try_get("pinned")?,
        create_time: from_micros(row.try_get("created_ts")?)?,
        update_time: from_micros(row.try_get("updated_ts")?)?,
        location: location
            .map(|raw| serde_json::from_str::<Location>(&raw))
            .transpose()?,
        tags: serde_json::from_str(&tags)?,
        property: MemoProperty {
            has_link: row.try_get("has_link")?,
            has_task_list: row.try_get("has_task_list")?,
            has_code: row.try_get("has_code")?,
            has_incomplete_tasks: row.try_get("has_incomplete_tasks")?,
        },
    })
}

fn encode_location(location: &Option<Location>) -> Result<Option<String>> {
    Ok(location.as_ref().map(serde_json::to_string).transpose()?)
}

/// SQLite memo repository.
#[derive(Clone)]
pub struct SqliteMemoRepository {
    pool: SqlitePool,
}

impl SqliteMemoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, req: NewMemo) -> Result<Memo> {
        let now = now_micros();
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO memo
               (uid, creator_id, content, visibility, row_status, pinned, tags, location,
                has_link, has_task_list, has_code, has_incomplete_tasks, created_ts, updated_ts)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(&req.uid)
        .bind(req.creator_id)
        .bind(&req.content)
        .bind(req.visibility.as_str())
        .bind(req.state.as_str())
        .bind(req.pinned)
        .bind(serde_json::to_string(&req.tags)?)
        .bind(encode_location(&req.location)?)
        .bind(req.property.has_link)
        .bind(req.property.has_task_list)
        .bind(req.property.has_code)
        .bind(req.property.has_incomplete_tasks)
        .bind(to_micros(now))
        .bind(to_micros(now))
        .fetch_one(&self.pool)
        .await?;

        debug!(
            subsystem = "database",
            component = "memos",
            op = "insert",
            memo_id = id,
            "Inserted memo"
        );

        Ok(Memo {
            id,
            uid: req.uid,
            creator_id: req.creator_id,
            content: req.content,
            visibility: req.visibility,
            state: req.state,
            pinned: req.pinned,
            create_time: now,
            update_time: now,
            location: req.location,
            tags: req.tags,
            property: req.property,
        })
    }

    pub async fn get_by_uid(&self, uid: &str) -> Result<Option<Memo>> {
        let sql = format!("SELECT {} FROM memo m WHERE m.uid = ?", MEMO_COLUMNS);
        sqlx::query(&sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| memo_from_row(&row))
            .transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Memo>> {
        let sql = format!("SELECT {} FROM memo m WHERE m.id = ?", MEMO_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| memo_from_row(&row))
            .transpose()
    }

    /// Persist `memo`'s mutable fields and stamp a new update time.
    ///
    /// When `revoked` is non-empty a `VISIBILITY_REVOKED` event addressed to
    /// those users is written in the same transaction.
    pub async fn update(&self, memo: &Memo, revoked: &[i64]) -> Result<Memo> {
        let now = now_micros();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE memo SET
                 content = ?, visibility = ?, row_status = ?, pinned = ?, tags = ?, location = ?,
                 has_link = ?, has_task_list = ?, has_code = ?, has_incomplete_tasks = ?,
                 updated_ts = ?
               WHERE id = ?"#,
        )
        .bind(&memo.content)
        .bind(memo.visibility.as_str())
        .bind(memo.state.as_str())
        .bind(memo.pinned)
        .bind(serde_json::to_string(&memo.tags)?)
        .bind(encode_location(&memo.location)?)
        .bind(memo.property.has_link)
        .bind(memo.property.has_task_list)
        .bind(memo.property.has_code)
        .bind(memo.property.has_incomplete_tasks)
        .bind(to_micros(now))
        .bind(memo.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("memo {} not found", memo.name())));
        }

        if !revoked.is_empty() {
            insert_event_tx(
                &mut tx,
                memo,
                MemoChangeEventType::VisibilityRevoked,
                now,
                revoked,
            )
            .await?;
        }

        tx.commit().await?;

        let mut updated = memo.clone();
        updated.update_time = now;
        Ok(updated)
    }

    /// Hard-delete `memo`, unlink its attachments and record a `DELETE`
    /// event for `recipients`, atomically.
    pub async fn delete(&self, memo: &Memo, recipients: &[i64]) -> Result<()> {
        let now = now_micros();
        let mut tx = self.pool.begin().await?;

        insert_event_tx(&mut tx, memo, MemoChangeEventType::Delete, now, recipients).await?;

        sqlx::query("UPDATE attachment SET memo_id = NULL, updated_ts = ? WHERE memo_id = ?")
            .bind(to_micros(now))
            .bind(memo.id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM memo WHERE id = ?")
            .bind(memo.id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("memo {} not found", memo.name())));
        }

        tx.commit().await?;
        debug!(
            subsystem = "database",
            component = "memos",
            op = "delete",
            memo_id = memo.id,
            "Deleted memo"
        );
        Ok(())
    }

    /// Memos visible to the query's viewer that pass the prefilter.
    ///
    /// Returns nothing without touching the database when the prefilter is
    /// unsatisfiable.
    pub async fn list(&self, query: &MemoQuery<'_>) -> Result<Vec<Memo>> {
        if query.prefilter.unsatisfiable {
            return Ok(Vec::new());
        }
        let (sql, params) = query.to_sql();
        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        let memos = rows.iter().map(memo_from_row).collect::<Result<Vec<_>>>()?;

        debug!(
            subsystem = "database",
            component = "memos",
            op = "list",
            candidate_count = memos.len(),
            "Fetched memo candidates"
        );
        Ok(memos)
    }

    /// Tag histogram over NORMAL memos of `creator_id` visible to `viewer`.
    ///
    /// Only ownership and PUBLIC/PROTECTED visibility are considered. A tag
    /// repeated within one memo counts once.
    pub async fn tag_counts(
        &self,
        creator_id: i64,
        viewer: Option<i64>,
    ) -> Result<BTreeMap<String, i64>> {
        let visibility_sql = match viewer {
            Some(v) if v == creator_id => "",
            Some(_) => " AND m.visibility IN ('PUBLIC', 'PROTECTED')",
            None => " AND m.visibility = 'PUBLIC'",
        };
        let sql = format!(
            r#"SELECT jt.value AS tag, COUNT(DISTINCT m.id) AS memo_count
               FROM memo m, json_each(m.tags) jt
               WHERE m.creator_id = ? AND m.row_status = 'NORMAL'{}
               GROUP BY jt.value"#,
            visibility_sql
        );
        let rows = sqlx::query(&sql)
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, i64)> {
                Ok((row.try_get("tag")?, row.try_get("memo_count")?))
            })
            .collect()
    }
}
