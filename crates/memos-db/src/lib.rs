//! # memos-db
//!
//! SQLite persistence and object storage for memos-server.
//!
//! This crate provides:
//! - Connection pool management and embedded migrations
//! - Repositories for memos, change events, attachments, upload sessions
//!   and workspace settings
//! - Translation of compiled memo prefilters into SQL
//! - Local filesystem and S3-compatible storage backends
//!
//! ## Example
//!
//! ```rust,ignore
//! use memos_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite://memos.db?mode=rwc").await?;
//!     db.migrate().await?;
//!
//!     let setting = db.settings.get_storage_setting().await?;
//!     println!("storage: {}", setting.storage_type);
//!     Ok(())
//! }
//! ```

pub mod attachments;
pub mod file_storage;
pub mod memo_changes;
pub mod memo_filter;
pub mod memos;
pub mod pool;
pub mod s3_storage;
pub mod settings;
pub mod upload_sessions;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) of dependent crates can use them
pub mod test_fixtures;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use memos_core::{Error, Result};

pub use attachments::SqliteAttachmentRepository;
pub use file_storage::{
    compute_content_hash, BoxedReader, ContentHasher, DirectUpload, LocalBackend,
    StorageBackend,
};
pub use memo_changes::SqliteMemoChangeRepository;
pub use memo_filter::{visibility_clause, MemoFilterQueryBuilder, QueryParam};
pub use memos::{MemoOrder, MemoQuery, SqliteMemoRepository};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use s3_storage::S3Backend;
pub use settings::SqliteSettingRepository;
pub use upload_sessions::SqliteUploadSessionRepository;

/// Convert a timestamp to the stored unix-microsecond form.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Convert a stored unix-microsecond value back to a timestamp.
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Internal(format!("timestamp out of range: {}", micros)))
}

/// Current time truncated to stored precision.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Main database interface.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    pub memos: SqliteMemoRepository,
    pub memo_changes: SqliteMemoChangeRepository,
    pub attachments: SqliteAttachmentRepository,
    pub upload_sessions: SqliteUploadSessionRepository,
    pub settings: SqliteSettingRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            memos: SqliteMemoRepository::new(pool.clone()),
            memo_changes: SqliteMemoChangeRepository::new(pool.clone()),
            attachments: SqliteAttachmentRepository::new(pool.clone()),
            upload_sessions: SqliteUploadSessionRepository::new(pool.clone()),
            settings: SqliteSettingRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_round_trip() {
        let now = now_micros();
        assert_eq!(from_micros(to_micros(now)).unwrap(), now);
    }

    #[test]
    fn test_from_micros_rejects_out_of_range() {
        assert!(from_micros(i64::MAX).is_err());
    }
}
