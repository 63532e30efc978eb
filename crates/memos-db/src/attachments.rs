//! Attachment metadata repository.
//!
//! Attachment rows are never shared, but several rows may point at the same
//! stored object after content deduplication. Physical deletion is driven by
//! [`SqliteAttachmentRepository::count_by_storage_key`].

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use memos_core::{
    Attachment, AttachmentThumbnail, Error, NewAttachment, Result, StorageType,
};

use crate::{from_micros, now_micros, to_micros};

const ATTACHMENT_COLUMNS: &str = "id, uid, creator_id, filename, content_type, size, content_hash, \
     storage_type, storage_key, memo_id, thumbnail_filename, thumbnail_content_type, \
     thumbnail_size, thumbnail_storage_key, created_ts, updated_ts";

fn attachment_from_row(row: &SqliteRow) -> Result<Attachment> {
    let storage_type: String = row.try_get("storage_type")?;
    let thumbnail_key: Option<String> = row.try_get("thumbnail_storage_key")?;
    let thumbnail = match thumbnail_key {
        Some(storage_key) => Some(AttachmentThumbnail {
            filename: row
                .try_get::<Option<String>, _>("thumbnail_filename")?
                .unwrap_or_default(),
            content_type: row
                .try_get::<Option<String>, _>("thumbnail_content_type")?
                .unwrap_or_else(|| "image/jpeg".to_string()),
            size: row.try_get::<Option<i64>, _>("thumbnail_size")?.unwrap_or(0),
            storage_key,
        }),
        None => None,
    };

    Ok(Attachment {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        creator_id: row.try_get("creator_id")?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        content_hash: row.try_get("content_hash")?,
        storage_type: StorageType::parse(&storage_type)
            .ok_or_else(|| Error::Internal(format!("unknown storage type: {}", storage_type)))?,
        storage_key: row.try_get("storage_key")?,
        memo_id: row.try_get("memo_id")?,
        thumbnail,
        create_time: from_micros(row.try_get("created_ts")?)?,
        update_time: from_micros(row.try_get("updated_ts")?)?,
    })
}

/// SQLite attachment repository.
#[derive(Clone)]
pub struct SqliteAttachmentRepository {
    pool: SqlitePool,
}

impl SqliteAttachmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, req: NewAttachment) -> Result<Attachment> {
        let now = now_micros();
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO attachment
               (uid, creator_id, filename, content_type, size, content_hash,
                storage_type, storage_key, memo_id, created_ts, updated_ts)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(&req.uid)
        .bind(req.creator_id)
        .bind(&req.filename)
        .bind(&req.content_type)
        .bind(req.size)
        .bind(&req.content_hash)
        .bind(req.storage_type.as_str())
        .bind(&req.storage_key)
        .bind(req.memo_id)
        .bind(to_micros(now))
        .bind(to_micros(now))
        .fetch_one(&self.pool)
        .await?;

        debug!(
            subsystem = "database",
            component = "attachments",
            op = "insert",
            attachment_id = id,
            storage_key = %req.storage_key,
            size_bytes = req.size,
            "Inserted attachment"
        );

        Ok(Attachment {
            id,
            uid: req.uid,
            creator_id: req.creator_id,
            filename: req.filename,
            content_type: req.content_type,
            size: req.size,
            content_hash: req.content_hash,
            storage_type: req.storage_type,
            storage_key: req.storage_key,
            memo_id: req.memo_id,
            thumbnail: None,
            create_time: now,
            update_time: now,
        })
    }

    pub async fn get_by_uid(&self, uid: &str) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {} FROM attachment WHERE uid = ?", ATTACHMENT_COLUMNS);
        sqlx::query(&sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| attachment_from_row(&row))
            .transpose()
    }

    /// Attachments of `creator_id`, newest first.
    pub async fn list_by_creator(&self, creator_id: i64) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachment WHERE creator_id = ? ORDER BY created_ts DESC, id DESC",
            ATTACHMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(creator_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attachment_from_row).collect()
    }

    pub async fn list_by_memo(&self, memo_id: i64) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachment WHERE memo_id = ? ORDER BY id",
            ATTACHMENT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(memo_id).fetch_all(&self.pool).await?;
        rows.iter().map(attachment_from_row).collect()
    }

    /// Most recent attachment of `creator_id` with identical content.
    pub async fn find_by_content_hash(
        &self,
        creator_id: i64,
        content_hash: &str,
    ) -> Result<Option<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachment WHERE creator_id = ? AND content_hash = ? \
             ORDER BY id DESC LIMIT 1",
            ATTACHMENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(creator_id)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| attachment_from_row(&row))
            .transpose()
    }

    /// Number of attachment rows backed by the object at `storage_key`.
    pub async fn count_by_storage_key(
        &self,
        storage_type: StorageType,
        storage_key: &str,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attachment WHERE storage_type = ? AND storage_key = ?",
        )
        .bind(storage_type.as_str())
        .bind(storage_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Whether any attachment or its thumbnail uses `storage_key`.
    pub async fn storage_key_in_use(&self, storage_key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM attachment WHERE storage_key = ? OR thumbnail_storage_key = ?)",
        )
        .bind(storage_key)
        .bind(storage_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Thumbnail already recorded by another row sharing `storage_key`.
    pub async fn find_shared_thumbnail(
        &self,
        storage_type: StorageType,
        storage_key: &str,
    ) -> Result<Option<AttachmentThumbnail>> {
        let sql = format!(
            "SELECT {} FROM attachment WHERE storage_type = ? AND storage_key = ? \
             AND thumbnail_storage_key IS NOT NULL LIMIT 1",
            ATTACHMENT_COLUMNS
        );
        let attachment = sqlx::query(&sql)
            .bind(storage_type.as_str())
            .bind(storage_key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| attachment_from_row(&row))
            .transpose()?;
        Ok(attachment.and_then(|a| a.thumbnail))
    }

    pub async fn set_thumbnail(&self, id: i64, thumbnail: &AttachmentThumbnail) -> Result<()> {
        sqlx::query(
            r#"UPDATE attachment SET
                 thumbnail_filename = ?, thumbnail_content_type = ?, thumbnail_size = ?,
                 thumbnail_storage_key = ?, updated_ts = ?
               WHERE id = ?"#,
        )
        .bind(&thumbnail.filename)
        .bind(&thumbnail.content_type)
        .bind(thumbnail.size)
        .bind(&thumbnail.storage_key)
        .bind(to_micros(now_micros()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_memo(&self, id: i64, memo_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE attachment SET memo_id = ?, updated_ts = ? WHERE id = ?")
            .bind(memo_id)
            .bind(to_micros(now_micros()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the row. Returns false when it did not exist.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attachment WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
