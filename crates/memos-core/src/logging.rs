//! Structured logging schema and field name constants for memos-server.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same field names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, best-effort step skipped |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated across a request. Format: UUIDv7.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "api", "db", "storage", "filter", "upload"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "memo_service", "attachment_service", "pool", "janitor"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "list_memos", "append_chunk", "complete_session"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Numeric memo ID being operated on.
pub const MEMO_ID: &str = "memo_id";

/// Numeric attachment ID being operated on.
pub const ATTACHMENT_ID: &str = "attachment_id";

/// Upload session ID.
pub const SESSION_ID: &str = "session_id";

/// Acting user ID (absent for anonymous viewers).
pub const VIEWER_ID: &str = "viewer_id";

/// Storage key of an object.
pub const STORAGE_KEY: &str = "storage_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of results returned by a query.
pub const RESULT_COUNT: &str = "result_count";

/// Number of candidate rows fetched before in-process filtering.
pub const CANDIDATE_COUNT: &str = "candidate_count";

/// Byte size of a payload.
pub const SIZE_BYTES: &str = "size_bytes";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
