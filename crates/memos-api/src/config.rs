//! Server configuration from the environment.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;

use memos_core::defaults::{MAX_BODY_BYTES, SERVER_PORT, UPLOAD_JANITOR_INTERVAL_SECS};
use memos_db::pool::DEFAULT_MAX_CONNECTIONS;

const DEFAULT_DATABASE_URL: &str = "sqlite://memos.db?mode=rwc";
const DEFAULT_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub host: String,
    pub port: u16,
    /// Parent of the local storage root and the upload scratch directory.
    pub data_dir: PathBuf,
    pub janitor_interval: Duration,
    pub allowed_origins: Vec<HeaderValue>,
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// Read configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `sqlite://memos.db?mode=rwc` |
    /// | `DB_MAX_CONNECTIONS` | `8` |
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `8081` |
    /// | `DATA_DIR` | `./data` |
    /// | `UPLOAD_JANITOR_INTERVAL_SECS` | `3600` |
    /// | `ALLOWED_ORIGINS` | `http://localhost:3000,http://localhost:5173` |
    /// | `MAX_BODY_BYTES` | 64 MiB |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            db_max_connections: parsed("DB_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed("PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(SERVER_PORT),
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            janitor_interval: Duration::from_secs(
                parsed("UPLOAD_JANITOR_INTERVAL_SECS")
                    .filter(|s| *s > 0)
                    .unwrap_or(UPLOAD_JANITOR_INTERVAL_SECS),
            ),
            allowed_origins: parse_allowed_origins(lookup("ALLOWED_ORIGINS").as_deref()),
            max_body_bytes: parsed("MAX_BODY_BYTES")
                .and_then(|b| usize::try_from(b).ok())
                .unwrap_or(MAX_BODY_BYTES),
        }
    }

    /// Root directory of locally stored attachments.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }

    /// Scratch files of in-progress local uploads.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

/// Parse a comma-separated CORS origin list, skipping invalid entries.
///
/// ```bash
/// ALLOWED_ORIGINS=https://memos.example.com,http://localhost:3000
/// ```
pub fn parse_allowed_origins(raw: Option<&str>) -> Vec<HeaderValue> {
    let origins_str = match raw {
        Some(s) if !s.trim().is_empty() => s,
        _ => DEFAULT_ORIGINS,
    };

    origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}
