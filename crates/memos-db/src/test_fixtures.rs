//! Test fixtures for database integration tests.
//!
//! Every [`TestDatabase`] is a freshly migrated SQLite file inside its own
//! temporary directory, so tests never share state and need no external
//! service. The directory (and database) is removed on drop.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use memos_db::test_fixtures::{TestDatabase, TestDataBuilder};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let test_db = TestDatabase::new().await;
//!     let memo = TestDataBuilder::new(&test_db.db)
//!         .memo(1, "hello #tag")
//!         .tags(&["tag"])
//!         .insert()
//!         .await;
//! }
//! ```

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use memos_core::{Location, Memo, MemoState, NewMemo, Visibility};

use crate::{Database, PoolConfig};

/// Migrated throwaway database.
pub struct TestDatabase {
    pub db: Database,
    dir: TempDir,
}

impl TestDatabase {
    /// Create and migrate a new database.
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("memos.db").display());
        let config = PoolConfig::new().max_connections(4).min_connections(1);

        let db = Database::connect_with_config(&url, config)
            .await
            .expect("Failed to create test database pool");
        db.migrate().await.expect("Failed to run migrations");

        Self { db, dir }
    }

    /// Directory owned by this fixture; usable as a storage root.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh subdirectory of [`TestDatabase::dir`].
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdir");
        path
    }
}

/// Builder for test memos with a fluent API.
pub struct TestDataBuilder<'a> {
    db: &'a Database,
}

impl<'a> TestDataBuilder<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Start a PRIVATE, NORMAL memo owned by `creator_id`.
    pub fn memo(&self, creator_id: i64, content: &str) -> MemoBuilder<'a> {
        MemoBuilder {
            db: self.db,
            memo: NewMemo {
                uid: format!("test{}", uuid_like()),
                creator_id,
                content: content.to_string(),
                visibility: Visibility::Private,
                state: MemoState::Normal,
                pinned: false,
                tags: Vec::new(),
                location: None,
                property: memos_core::properties::extract(content),
            },
        }
    }
}

/// Builder for a single memo row.
pub struct MemoBuilder<'a> {
    db: &'a Database,
    memo: NewMemo,
}

impl<'a> MemoBuilder<'a> {
    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.memo.visibility = visibility;
        self
    }

    pub fn state(mut self, state: MemoState) -> Self {
        self.memo.state = state;
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.memo.pinned = pinned;
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.memo.tags = memos_core::normalize_tags(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.memo.location = Some(location);
        self
    }

    pub async fn insert(self) -> Memo {
        self.db
            .memos
            .insert(self.memo)
            .await
            .expect("Failed to insert test memo")
    }
}

fn uuid_like() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(18)
        .map(char::from)
        .collect()
}
