//! Centralized default constants for memos-server.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// MEMO LISTING
// =============================================================================

/// Default page size for memo listing.
pub const PAGE_SIZE: i32 = 50;

/// Maximum page size accepted for memo listing.
pub const MAX_PAGE_SIZE: i32 = 200;

/// Hard cap on candidate rows fetched before in-process filtering.
pub const MEMO_CANDIDATE_LIMIT: i64 = 10_000;

/// Length of generated memo and attachment uids.
pub const UID_LENGTH: usize = 22;

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// Default upload size limit in megabytes when the workspace has not set one.
pub const UPLOAD_SIZE_LIMIT_MB: i64 = 30;

/// Number of attempts at allocating a collision-free storage key.
pub const STORAGE_KEY_MAX_ATTEMPTS: usize = 8;

/// Length of the random component of a storage key.
pub const STORAGE_KEY_ID_LENGTH: usize = 24;

/// Length of a generated upload session id.
pub const UPLOAD_SESSION_ID_LENGTH: usize = 32;

/// Upload sessions untouched for longer than this are expired.
pub const UPLOAD_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// Rows deleted per expired-session sweep batch.
pub const UPLOAD_SESSION_CLEANUP_BATCH: i64 = 200;

/// Default interval between upload janitor sweeps.
pub const UPLOAD_JANITOR_INTERVAL_SECS: u64 = 60 * 60;

/// Part size requested for S3 multipart upload sessions (8 MiB).
pub const MULTIPART_PART_SIZE: i64 = 8 * 1024 * 1024;

/// Smallest part size S3 accepts for non-final parts (5 MiB).
pub const MULTIPART_MIN_PART_SIZE: i64 = 5 * 1024 * 1024;

/// Lifetime of presigned upload/download URLs in seconds.
pub const PRESIGN_EXPIRY_SECS: u64 = 15 * 60;

// =============================================================================
// THUMBNAILS
// =============================================================================

/// Largest source image considered for thumbnail generation.
pub const THUMBNAIL_SOURCE_MAX_BYTES: i64 = 40 * 1024 * 1024;

/// Largest client-supplied thumbnail source for an upload session.
pub const THUMBNAIL_UPLOAD_MAX_BYTES: i64 = 8 * 1024 * 1024;

/// Bounding box for generated thumbnails.
pub const THUMBNAIL_MAX_DIMENSION: u32 = 640;

/// JPEG quality for generated thumbnails.
pub const THUMBNAIL_JPEG_QUALITY: u8 = 80;

/// Suffix appended to an attachment storage key to form its thumbnail key.
pub const THUMBNAIL_KEY_SUFFIX: &str = ".thumb.jpg";

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 8081;

/// Default request body limit (covers inline base64 uploads at the default size limit).
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
