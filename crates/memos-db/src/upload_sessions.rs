//! Upload session repository.
//!
//! Offsets advance only through a conditional update on the previously
//! observed `received_size`, so concurrent appends to one session resolve
//! to exactly one winner per offset.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use memos_core::{AttachmentUploadSession, NewUploadSession, Result, UploadTarget};

use crate::{from_micros, now_micros, to_micros};

const SESSION_COLUMNS: &str = "id, creator_id, filename, content_type, size, memo_name, temp_path, \
     received_size, thumbnail_temp_path, created_ts, updated_ts";

fn session_from_row(row: &SqliteRow) -> Result<AttachmentUploadSession> {
    let temp_path: String = row.try_get("temp_path")?;
    Ok(AttachmentUploadSession {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        memo_name: row.try_get("memo_name")?,
        target: UploadTarget::decode(&temp_path)?,
        received_size: row.try_get("received_size")?,
        thumbnail_temp_path: row.try_get("thumbnail_temp_path")?,
        create_time: from_micros(row.try_get("created_ts")?)?,
        update_time: from_micros(row.try_get("updated_ts")?)?,
    })
}

/// SQLite upload session repository.
#[derive(Clone)]
pub struct SqliteUploadSessionRepository {
    pool: SqlitePool,
}

impl SqliteUploadSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, req: NewUploadSession) -> Result<AttachmentUploadSession> {
        let now = now_micros();
        sqlx::query(
            r#"INSERT INTO attachment_upload_session
               (id, creator_id, filename, content_type, size, memo_name, temp_path,
                received_size, created_ts, updated_ts)
               VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(&req.id)
        .bind(req.creator_id)
        .bind(&req.filename)
        .bind(&req.content_type)
        .bind(req.size)
        .bind(&req.memo_name)
        .bind(req.target.encode())
        .bind(to_micros(now))
        .bind(to_micros(now))
        .execute(&self.pool)
        .await?;

        debug!(
            subsystem = "database",
            component = "upload_sessions",
            op = "insert",
            session_id = %req.id,
            mode = req.target.mode(),
            size_bytes = req.size,
            "Created upload session"
        );

        Ok(AttachmentUploadSession {
            id: req.id,
            creator_id: req.creator_id,
            filename: req.filename,
            content_type: req.content_type,
            size: req.size,
            memo_name: req.memo_name,
            target: req.target,
            received_size: 0,
            thumbnail_temp_path: None,
            create_time: now,
            update_time: now,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<AttachmentUploadSession>> {
        let sql = format!(
            "SELECT {} FROM attachment_upload_session WHERE id = ?",
            SESSION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| session_from_row(&row))
            .transpose()
    }

    /// Compare-and-swap the received offset. Returns false when the stored
    /// offset no longer equals `expected` (or the session is gone).
    pub async fn advance_offset(&self, id: &str, expected: i64, new_offset: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE attachment_upload_session
               SET received_size = ?, updated_ts = ?
               WHERE id = ? AND received_size = ?"#,
        )
        .bind(new_offset)
        .bind(to_micros(now_micros()))
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_thumbnail_temp_path(&self, id: &str, path: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE attachment_upload_session
               SET thumbnail_temp_path = ?, updated_ts = ?
               WHERE id = ?"#,
        )
        .bind(path)
        .bind(to_micros(now_micros()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Refresh `updated_ts` so an active session is not swept.
    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE attachment_upload_session SET updated_ts = ? WHERE id = ?")
            .bind(to_micros(now_micros()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the row. Returns false when another caller already removed it.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attachment_upload_session WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Up to `limit` sessions last updated before `cutoff`, oldest first.
    pub async fn list_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AttachmentUploadSession>> {
        let sql = format!(
            "SELECT {} FROM attachment_upload_session WHERE updated_ts < ? \
             ORDER BY updated_ts, id LIMIT ?",
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_micros(cutoff))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Force `updated_ts`; used to age sessions in tests and by maintenance tooling.
    pub async fn set_updated_time(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE attachment_upload_session SET updated_ts = ? WHERE id = ?")
            .bind(to_micros(ts))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
