//! # memos-core
//!
//! Core types, error handling and the memo filter compiler for memos-server.
//!
//! This crate performs no I/O; persistence lives in `memos-db` and the HTTP
//! surface in `memos-api`.

pub mod defaults;
pub mod error;
pub mod filter;
pub mod logging;
pub mod models;
pub mod properties;
pub mod tags;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use filter::{
    CompiledFilter, MemoSqlPrefilter, TagMatchGroup, TagMatchKind, TagMatchOption,
};
pub use models::*;
pub use tags::{collab_tag, normalize_tags, parse_collab_tag, COLLAB_TAG_PREFIX};
