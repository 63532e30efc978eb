//! Memo change events: the deletion / visibility-revocation half of the
//! sync feed.

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use memos_core::{Error, Memo, MemoChangeEvent, MemoChangeEventType, Result};

use crate::{from_micros, to_micros};

/// Record an event and its recipients inside the caller's transaction.
pub async fn insert_event_tx(
    tx: &mut Transaction<'_, Sqlite>,
    memo: &Memo,
    event_type: MemoChangeEventType,
    event_time: DateTime<Utc>,
    recipients: &[i64],
) -> Result<i64> {
    let event_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO memo_change_event (memo_id, memo_name, creator_id, event_type, event_ts)
           VALUES (?, ?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(memo.id)
    .bind(memo.name())
    .bind(memo.creator_id)
    .bind(event_type.as_str())
    .bind(to_micros(event_time))
    .fetch_one(&mut **tx)
    .await?;

    for user_id in recipients {
        sqlx::query(
            "INSERT OR IGNORE INTO memo_change_event_recipient (event_id, user_id) VALUES (?, ?)",
        )
        .bind(event_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    }

    debug!(
        subsystem = "database",
        component = "memo_changes",
        op = "insert_event",
        memo_id = memo.id,
        event_type = event_type.as_str(),
        result_count = recipients.len(),
        "Recorded memo change event"
    );
    Ok(event_id)
}

/// SQLite memo change event repository.
#[derive(Clone)]
pub struct SqliteMemoChangeRepository {
    pool: SqlitePool,
}

impl SqliteMemoChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Names of memos deleted or revoked for `viewer` within `(after, until]`,
    /// in order of their first event.
    pub async fn list_removed_memo_names(
        &self,
        viewer: i64,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"SELECT e.memo_name
               FROM memo_change_event e
               JOIN memo_change_event_recipient r ON r.event_id = e.id
               WHERE r.user_id = ?
                 AND e.event_type IN ('DELETE', 'VISIBILITY_REVOKED')
                 AND e.event_ts > ? AND e.event_ts <= ?
               GROUP BY e.memo_name
               ORDER BY MIN(e.event_ts), MIN(e.id)"#,
        )
        .bind(viewer)
        .bind(to_micros(after))
        .bind(to_micros(until))
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// All events recorded for a memo, oldest first.
    pub async fn list_for_memo(&self, memo_id: i64) -> Result<Vec<MemoChangeEvent>> {
        let rows = sqlx::query(
            r#"SELECT e.id, e.memo_id, e.memo_name, e.creator_id, e.event_type, e.event_ts,
                      COALESCE((SELECT json_group_array(r.user_id)
                                FROM memo_change_event_recipient r
                                WHERE r.event_id = e.id), '[]') AS recipients
               FROM memo_change_event e
               WHERE e.memo_id = ?
               ORDER BY e.event_ts, e.id"#,
        )
        .bind(memo_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MemoChangeEvent> {
                let event_type: String = row.try_get("event_type")?;
                let recipients: String = row.try_get("recipients")?;
                let mut recipients: Vec<i64> = serde_json::from_str(&recipients)?;
                recipients.sort_unstable();
                Ok(MemoChangeEvent {
                    id: row.try_get("id")?,
                    memo_id: row.try_get("memo_id")?,
                    memo_name: row.try_get("memo_name")?,
                    creator_id: row.try_get("creator_id")?,
                    event_type: MemoChangeEventType::parse(&event_type).ok_or_else(|| {
                        Error::Internal(format!("unknown memo change event type: {}", event_type))
                    })?,
                    event_time: from_micros(row.try_get("event_ts")?)?,
                    recipients,
                })
            })
            .collect()
    }
}
