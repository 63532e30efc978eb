//! Workspace settings store.

use sqlx::SqlitePool;
use tracing::info;

use memos_core::{Result, StorageSetting};

/// Setting key of the storage selection.
pub const STORAGE_SETTING_KEY: &str = "STORAGE";

/// SQLite key/value workspace setting repository.
#[derive(Clone)]
pub struct SqliteSettingRepository {
    pool: SqlitePool,
}

impl SqliteSettingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_raw(&self, name: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM workspace_setting WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn upsert_raw(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO workspace_setting (name, value) VALUES (?, ?)
               ON CONFLICT (name) DO UPDATE SET value = excluded.value"#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current storage selection; the LOCAL default is persisted on first read.
    pub async fn get_storage_setting(&self) -> Result<StorageSetting> {
        if let Some(raw) = self.get_raw(STORAGE_SETTING_KEY).await? {
            return Ok(serde_json::from_str(&raw)?);
        }

        let default = StorageSetting::default();
        let raw = serde_json::to_string(&default)?;
        // A concurrent first read may have stored its own default already.
        sqlx::query("INSERT OR IGNORE INTO workspace_setting (name, value) VALUES (?, ?)")
            .bind(STORAGE_SETTING_KEY)
            .bind(&raw)
            .execute(&self.pool)
            .await?;
        info!(
            subsystem = "database",
            component = "settings",
            op = "init_storage_setting",
            storage_type = default.storage_type.as_str(),
            "Persisted default storage setting"
        );

        match self.get_raw(STORAGE_SETTING_KEY).await? {
            Some(stored) => Ok(serde_json::from_str(&stored)?),
            None => Ok(default),
        }
    }

    pub async fn set_storage_setting(&self, setting: &StorageSetting) -> Result<()> {
        self.upsert_raw(STORAGE_SETTING_KEY, &serde_json::to_string(setting)?)
            .await
    }
}
