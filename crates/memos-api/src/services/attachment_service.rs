//! Attachment upload engine.
//!
//! Three ways bytes reach permanent storage:
//!
//! - **Inline**: one request carrying base64 content.
//! - **Resumable local**: a session backed by a scratch file, filled by
//!   offset-checked chunk appends and committed on completion.
//! - **S3 direct / multipart**: the client uploads straight to the object
//!   store through presigned URLs; the server only verifies and records.
//!
//! Attachment rows are never shared, but a creator's identical content is
//! stored once and referenced by every row carrying the same storage key.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use memos_core::defaults::{
    MULTIPART_MIN_PART_SIZE, MULTIPART_PART_SIZE, PRESIGN_EXPIRY_SECS, STORAGE_KEY_ID_LENGTH,
    STORAGE_KEY_MAX_ATTEMPTS, THUMBNAIL_SOURCE_MAX_BYTES, THUMBNAIL_UPLOAD_MAX_BYTES, UID_LENGTH,
    UPLOAD_SESSION_CLEANUP_BATCH, UPLOAD_SESSION_ID_LENGTH, UPLOAD_SESSION_TTL_SECS,
};
use memos_core::{
    parse_memo_name, Attachment, AttachmentThumbnail, AttachmentUploadSession, CreateAttachment,
    CreateUploadSession, Error, NewAttachment, NewUploadSession, Result, StorageSetting,
    StorageType, UploadSessionProgress, UploadTarget, UploadedPart,
};
use memos_db::{compute_content_hash, BoxedReader, ContentHasher, Database, StorageBackend};

use super::keyed_mutex::{KeyedGuard, KeyedMutex};
use super::random_id;
use super::storage::StorageResolver;
use super::thumbnail;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// S3 caps a multipart upload at this many parts.
const MAX_PART_NUMBER: i32 = 10_000;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// A freshly opened upload session.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub session: AttachmentUploadSession,
    pub progress: UploadSessionProgress,
    /// Presigned PUT URL for S3 direct sessions.
    pub upload_url: Option<String>,
}

/// Presigned URL for the next part of a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUploadUrl {
    pub upload_url: String,
    pub part_number: i32,
    pub offset: i64,
    pub size: i64,
}

/// Requested byte range of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` or `bytes=start-end` (inclusive).
    From { start: u64, end: Option<u64> },
    /// `bytes=-len`: the final `len` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Parse a single-range `Range` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid range: {}", header));
        let ranges = header.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        if ranges.contains(',') {
            return Err(Error::InvalidInput("multiple ranges are not supported".into()));
        }
        let (start, end) = ranges.split_once('-').ok_or_else(invalid)?;
        let (start, end) = (start.trim(), end.trim());
        if start.is_empty() {
            let len: u64 = end.parse().map_err(|_| invalid())?;
            return Ok(Self::Suffix(len));
        }
        let start: u64 = start.parse().map_err(|_| invalid())?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().map_err(|_| invalid())?)
        };
        if matches!(end, Some(end) if end < start) {
            return Err(invalid());
        }
        Ok(Self::From { start, end })
    }

    /// Inclusive `(start, end)` within an object of `total` bytes.
    pub fn resolve(&self, total: u64) -> Result<(u64, u64)> {
        let unsatisfiable = || Error::InvalidInput(format!("range not satisfiable for {} bytes", total));
        if total == 0 {
            return Err(unsatisfiable());
        }
        match *self {
            Self::From { start, end } => {
                if start >= total {
                    return Err(unsatisfiable());
                }
                Ok((start, end.map_or(total - 1, |e| e.min(total - 1))))
            }
            Self::Suffix(0) => Err(unsatisfiable()),
            Self::Suffix(len) => Ok((total.saturating_sub(len), total - 1)),
        }
    }
}

/// Bytes of a stored attachment, or where to fetch them.
pub enum AttachmentContent {
    Stream {
        filename: String,
        content_type: String,
        /// Size of the whole object.
        total_size: u64,
        /// Inclusive byte range being returned, when partial.
        range: Option<(u64, u64)>,
        reader: BoxedReader,
    },
    /// Presigned GET URL on the object store.
    Redirect(String),
}

/// Where thumbnail source bytes come from.
enum ThumbnailSource<'a> {
    Bytes(&'a [u8]),
    File { path: &'a Path, max_bytes: i64 },
    Stored,
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_viewer(viewer: Option<i64>) -> Result<i64> {
    viewer.ok_or_else(|| Error::Unauthenticated("attachments require a signed-in user".into()))
}

fn validate_filename(filename: &str) -> Result<String> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(Error::InvalidInput("filename is required".into()));
    }
    if filename.contains(['/', '\\']) {
        return Err(Error::InvalidInput(format!("invalid filename: {}", filename)));
    }
    Ok(filename.to_string())
}

/// Lower-cased extension of `filename`, with its dot, when it looks sane.
fn extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

fn content_type_of(declared: Option<&str>, data: Option<&[u8]>) -> String {
    if let Some(ct) = declared.map(str::trim).filter(|ct| !ct.is_empty()) {
        return ct.to_string();
    }
    data.and_then(infer::get)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Parts `1..=n` with no gap, and their total size.
pub fn contiguous_prefix(parts: &[UploadedPart]) -> (Vec<UploadedPart>, i64) {
    let mut sorted: Vec<&UploadedPart> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_number);

    let mut prefix = Vec::new();
    let mut total = 0i64;
    let mut next = 1;
    for part in sorted {
        if part.part_number < next {
            continue;
        }
        if part.part_number > next {
            break;
        }
        total += part.size;
        prefix.push(part.clone());
        next += 1;
    }
    (prefix, total)
}

/// Stand-in content hash for objects the server never read.
///
/// Only ever equal for the same upload, so it never deduplicates against
/// real content hashes.
fn synthetic_hash(
    creator_id: i64,
    upload_id: &str,
    storage_key: &str,
    size: i64,
    parts: &[UploadedPart],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("s3-upload:{}:{}:{}:{}", creator_id, upload_id, storage_key, size));
    for part in parts {
        hasher.update(format!(":{}-{}-{}", part.part_number, part.size, part.etag));
    }
    hex::encode(hasher.finalize())
}

async fn remove_scratch_file(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn presign_expiry() -> Duration {
    Duration::from_secs(PRESIGN_EXPIRY_SECS)
}

fn object_lock_key(storage_type: StorageType, storage_key: &str) -> String {
    format!("{}:{}", storage_type, storage_key)
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct AttachmentService {
    db: Database,
    storage: StorageResolver,
    scratch_dir: PathBuf,
    /// Serialises chunk appends, completion and cancel of one session.
    session_locks: KeyedMutex,
    /// Serialises content reuse against refcounted object deletion.
    object_locks: KeyedMutex,
    thumbnail_locks: KeyedMutex,
}

impl AttachmentService {
    pub fn new(db: Database, storage: StorageResolver, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            storage,
            scratch_dir: scratch_dir.into(),
            session_locks: KeyedMutex::new(),
            object_locks: KeyedMutex::new(),
            thumbnail_locks: KeyedMutex::new(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    async fn storage_setting(&self) -> Result<StorageSetting> {
        self.db.settings.get_storage_setting().await
    }

    /// The object-store backend serving S3 sessions.
    fn s3_backend(&self, setting: &StorageSetting) -> Result<Arc<dyn StorageBackend>> {
        self.storage.backend_for(StorageType::S3, setting)
    }

    /// Memo id for an attachment link; the creator must be able to edit the memo.
    async fn resolve_memo_link(&self, creator_id: i64, memo_name: Option<&str>) -> Result<Option<i64>> {
        let Some(name) = memo_name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let uid = parse_memo_name(name)?;
        match self.db.memos.get_by_uid(uid).await? {
            Some(memo) if memo.can_modify(creator_id) => Ok(Some(memo.id)),
            _ => Err(Error::NotFound(format!("memo {}", uid))),
        }
    }

    /// A fresh storage key unused by any row or object.
    async fn allocate_storage_key(&self, backend: &dyn StorageBackend, filename: &str) -> Result<String> {
        let ext = extension(filename);
        for _ in 0..STORAGE_KEY_MAX_ATTEMPTS {
            let key = format!("attachments/{}{}", random_id(STORAGE_KEY_ID_LENGTH), ext);
            if self.db.attachments.storage_key_in_use(&key).await? {
                continue;
            }
            if backend.exists(&key).await? {
                continue;
            }
            return Ok(key);
        }
        Err(Error::Internal(format!(
            "no free storage key after {} attempts",
            STORAGE_KEY_MAX_ATTEMPTS
        )))
    }

    /// Existing object of `creator_id` with identical content on `storage_type`.
    async fn reusable_object(
        &self,
        creator_id: i64,
        content_hash: &str,
        storage_type: StorageType,
    ) -> Result<Option<Attachment>> {
        Ok(self
            .db
            .attachments
            .find_by_content_hash(creator_id, content_hash)
            .await?
            .filter(|a| a.storage_type == storage_type))
    }

    /// Lock the object of an existing row with identical content. `None`
    /// when no such row survives or its object is gone. The guard must be
    /// held until the new row referencing the object is inserted.
    async fn claim_reusable_object(
        &self,
        backend: &dyn StorageBackend,
        creator_id: i64,
        content_hash: &str,
    ) -> Result<Option<(String, KeyedGuard)>> {
        let Some(existing) = self
            .reusable_object(creator_id, content_hash, backend.storage_type())
            .await?
        else {
            return Ok(None);
        };
        let guard = self
            .object_locks
            .lock(&object_lock_key(existing.storage_type, &existing.storage_key))
            .await;
        let referenced = self
            .db
            .attachments
            .count_by_storage_key(existing.storage_type, &existing.storage_key)
            .await?
            > 0;
        if !referenced || !backend.exists(&existing.storage_key).await? {
            return Ok(None);
        }
        Ok(Some((existing.storage_key, guard)))
    }

    /// Insert the row; a freshly written object is removed if that fails.
    async fn insert_attachment(
        &self,
        backend: &dyn StorageBackend,
        req: NewAttachment,
        fresh_object: bool,
    ) -> Result<Attachment> {
        let storage_key = req.storage_key.clone();
        match self.db.attachments.insert(req).await {
            Ok(attachment) => Ok(attachment),
            Err(e) => {
                if fresh_object {
                    if let Err(cleanup) = backend.delete(&storage_key).await {
                        warn!(
                            subsystem = "upload",
                            storage_key = %storage_key,
                            error = %cleanup,
                            "Failed to remove object after insert failure"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // INLINE
    // =========================================================================

    pub async fn create_attachment(
        &self,
        viewer: Option<i64>,
        req: CreateAttachment,
    ) -> Result<Attachment> {
        let start = Instant::now();
        let creator_id = require_viewer(viewer)?;
        let filename = validate_filename(&req.filename)?;
        let data = BASE64_STANDARD
            .decode(req.content.trim())
            .map_err(|e| Error::InvalidInput(format!("invalid base64 content: {}", e)))?;

        let setting = self.storage_setting().await?;
        let size = data.len() as i64;
        if size > setting.upload_size_limit_bytes() {
            return Err(Error::InvalidInput(format!(
                "file size {} exceeds the {} MB limit",
                size, setting.upload_size_limit_mb
            )));
        }
        let memo_id = self.resolve_memo_link(creator_id, req.memo_name.as_deref()).await?;
        let content_type = content_type_of(req.content_type.as_deref(), Some(data.as_slice()));
        let content_hash = compute_content_hash(&data);
        let backend = self.storage.resolve(&setting)?;

        let (storage_key, fresh, object_guard) = match self
            .claim_reusable_object(backend.as_ref(), creator_id, &content_hash)
            .await?
        {
            Some((key, guard)) => {
                debug!(
                    subsystem = "upload",
                    op = "create_attachment",
                    storage_key = %key,
                    "Reusing stored content"
                );
                (key, false, Some(guard))
            }
            None => {
                let key = self.allocate_storage_key(backend.as_ref(), &filename).await?;
                backend
                    .put(&key, &content_type, Bytes::copy_from_slice(&data))
                    .await?;
                (key, true, None)
            }
        };

        let attachment = self
            .insert_attachment(
                backend.as_ref(),
                NewAttachment {
                    uid: random_id(UID_LENGTH),
                    creator_id,
                    filename,
                    content_type,
                    size,
                    content_hash,
                    storage_type: backend.storage_type(),
                    storage_key,
                    memo_id,
                },
                fresh,
            )
            .await?;
        drop(object_guard);

        let attachment = self
            .ensure_thumbnail(attachment, &setting, ThumbnailSource::Bytes(&data))
            .await;

        info!(
            subsystem = "upload",
            op = "create_attachment",
            attachment_id = attachment.id,
            viewer_id = creator_id,
            size_bytes = size,
            deduplicated = !fresh,
            duration_ms = start.elapsed().as_millis() as u64,
            "Created attachment"
        );
        Ok(attachment)
    }

    // =========================================================================
    // UPLOAD SESSIONS
    // =========================================================================

    /// Open a resumable upload. S3 backends get a multipart upload, or a
    /// presigned PUT when the store cannot do multipart; otherwise bytes go
    /// to a scratch file of the declared size.
    pub async fn create_upload_session(
        &self,
        viewer: Option<i64>,
        req: CreateUploadSession,
    ) -> Result<UploadTicket> {
        let creator_id = require_viewer(viewer)?;
        let filename = validate_filename(&req.filename)?;
        let setting = self.storage_setting().await?;
        if req.size <= 0 {
            return Err(Error::InvalidInput("declared size must be positive".into()));
        }
        if req.size > setting.upload_size_limit_bytes() {
            return Err(Error::InvalidInput(format!(
                "file size {} exceeds the {} MB limit",
                req.size, setting.upload_size_limit_mb
            )));
        }
        let memo_name = req
            .memo_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        self.resolve_memo_link(creator_id, memo_name.as_deref()).await?;

        let content_type = content_type_of(req.content_type.as_deref(), None);
        let id = random_id(UPLOAD_SESSION_ID_LENGTH);
        let backend = self.storage.resolve(&setting)?;

        let (target, upload_url) = match backend.direct_upload() {
            Some(direct) => {
                let storage_key = self.allocate_storage_key(backend.as_ref(), &filename).await?;
                match direct.create_multipart_upload(&storage_key, &content_type).await {
                    Ok(upload_id) => (
                        UploadTarget::S3Multipart {
                            storage_key,
                            upload_id,
                            part_size: MULTIPART_PART_SIZE,
                        },
                        None,
                    ),
                    Err(Error::Unsupported(reason)) => {
                        debug!(
                            subsystem = "upload",
                            session_id = %id,
                            reason = %reason,
                            "Multipart unsupported, using presigned PUT"
                        );
                        let url = direct
                            .presign_put_object_url(&storage_key, &content_type, presign_expiry())
                            .await?;
                        (UploadTarget::S3Direct { storage_key }, Some(url))
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                fs::create_dir_all(&self.scratch_dir).await?;
                let path = self.scratch_dir.join(format!("{}.part", id));
                let file = fs::File::create(&path).await?;
                file.set_len(req.size as u64).await?;
                (
                    UploadTarget::Local {
                        temp_path: path.to_string_lossy().into_owned(),
                    },
                    None,
                )
            }
        };

        let inserted = self
            .db
            .upload_sessions
            .insert(NewUploadSession {
                id: id.clone(),
                creator_id,
                filename,
                content_type,
                size: req.size,
                memo_name,
                target: target.clone(),
            })
            .await;
        let session = match inserted {
            Ok(session) => session,
            Err(e) => {
                let orphan = AttachmentUploadSession {
                    id: id.clone(),
                    creator_id,
                    filename: String::new(),
                    content_type: String::new(),
                    size: req.size,
                    memo_name: None,
                    target,
                    received_size: 0,
                    thumbnail_temp_path: None,
                    create_time: Utc::now(),
                    update_time: Utc::now(),
                };
                if let Err(cleanup) = self.release_session_resources(&orphan).await {
                    warn!(subsystem = "upload", session_id = %id, error = %cleanup, "Failed to release orphaned upload target");
                }
                return Err(e);
            }
        };

        let progress = initial_progress(&session);
        info!(
            subsystem = "upload",
            op = "create_upload_session",
            session_id = %session.id,
            viewer_id = creator_id,
            mode = session.target.mode(),
            size_bytes = session.size,
            "Opened upload session"
        );
        Ok(UploadTicket {
            session,
            progress,
            upload_url,
        })
    }

    /// Session owned by the viewer; foreign sessions are reported as missing.
    async fn owned_session(&self, viewer: Option<i64>, id: &str) -> Result<AttachmentUploadSession> {
        let creator_id = require_viewer(viewer)?;
        match self.db.upload_sessions.get(id).await? {
            Some(session) if session.creator_id == creator_id => Ok(session),
            _ => Err(Error::NotFound(format!("upload session {}", id))),
        }
    }

    /// Write `data` at `expected_offset` of a local session.
    ///
    /// Appends to one session run one at a time: the offset is checked, the
    /// bytes written and the offset advanced under the session lock. A caller
    /// whose offset is stale gets the authoritative offset back.
    pub async fn append_upload_chunk(
        &self,
        viewer: Option<i64>,
        id: &str,
        expected_offset: i64,
        data: Bytes,
    ) -> Result<UploadSessionProgress> {
        let _session_guard = self.session_locks.lock(id).await;
        let session = self.owned_session(viewer, id).await?;
        let UploadTarget::Local { temp_path } = &session.target else {
            return Err(Error::InvalidInput(format!(
                "{} sessions do not accept chunk appends",
                session.target.mode()
            )));
        };
        if expected_offset != session.received_size {
            return Err(Error::OffsetMismatch {
                expected: expected_offset,
                current: session.received_size,
            });
        }
        if data.is_empty() {
            return Err(Error::InvalidInput("empty chunk".into()));
        }
        let new_offset = expected_offset + data.len() as i64;
        if new_offset > session.size {
            return Err(Error::InvalidInput(format!(
                "chunk of {} bytes at offset {} exceeds declared size {}",
                data.len(),
                expected_offset,
                session.size
            )));
        }

        let mut file = fs::OpenOptions::new().write(true).open(temp_path).await?;
        file.seek(SeekFrom::Start(expected_offset as u64)).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;

        if !self
            .db
            .upload_sessions
            .advance_offset(id, expected_offset, new_offset)
            .await?
        {
            let current = self
                .db
                .upload_sessions
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("upload session {}", id)))?
                .received_size;
            return Err(Error::OffsetMismatch {
                expected: expected_offset,
                current,
            });
        }

        debug!(
            subsystem = "upload",
            op = "append_chunk",
            session_id = %id,
            size_bytes = data.len(),
            offset = new_offset,
            "Appended chunk"
        );
        Ok(UploadSessionProgress {
            received_size: new_offset,
            ..initial_progress(&session)
        })
    }

    pub async fn get_upload_session_progress(
        &self,
        viewer: Option<i64>,
        id: &str,
    ) -> Result<UploadSessionProgress> {
        let session = self.owned_session(viewer, id).await?;
        self.progress_of(&session).await
    }

    async fn progress_of(&self, session: &AttachmentUploadSession) -> Result<UploadSessionProgress> {
        match &session.target {
            UploadTarget::Local { .. } | UploadTarget::S3Direct { .. } => Ok(initial_progress(session)),
            UploadTarget::S3Multipart {
                storage_key,
                upload_id,
                ..
            } => {
                let parts = self.list_parts(storage_key, upload_id).await?;
                let (prefix, received) = contiguous_prefix(&parts);
                Ok(UploadSessionProgress {
                    received_size: received,
                    next_part_number: Some(prefix.len() as i32 + 1),
                    ..initial_progress(session)
                })
            }
        }
    }

    async fn list_parts(&self, storage_key: &str, upload_id: &str) -> Result<Vec<UploadedPart>> {
        let setting = self.storage_setting().await?;
        let backend = self.s3_backend(&setting)?;
        let direct = backend
            .direct_upload()
            .ok_or_else(|| Error::Unsupported("backend has no multipart support".into()))?;
        direct.list_multipart_uploaded_parts(storage_key, upload_id).await
    }

    /// Presign the next part of a multipart session.
    ///
    /// Parts must be requested in order: `part_number` must follow the
    /// contiguous prefix already uploaded and `expected_offset` must equal
    /// that prefix's size.
    pub async fn create_multipart_part_upload_url(
        &self,
        viewer: Option<i64>,
        id: &str,
        expected_offset: i64,
        part_number: i32,
        size: i64,
    ) -> Result<PartUploadUrl> {
        let session = self.owned_session(viewer, id).await?;
        let UploadTarget::S3Multipart {
            storage_key,
            upload_id,
            ..
        } = &session.target
        else {
            return Err(Error::InvalidInput(format!(
                "{} sessions do not use multipart parts",
                session.target.mode()
            )));
        };
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(Error::InvalidInput(format!("invalid part number {}", part_number)));
        }
        if size <= 0 {
            return Err(Error::InvalidInput("part size must be positive".into()));
        }

        let setting = self.storage_setting().await?;
        let backend = self.s3_backend(&setting)?;
        let direct = backend
            .direct_upload()
            .ok_or_else(|| Error::Unsupported("backend has no multipart support".into()))?;
        let parts = direct.list_multipart_uploaded_parts(storage_key, upload_id).await?;
        let (prefix, uploaded) = contiguous_prefix(&parts);
        let next_part = prefix.len() as i32 + 1;
        if part_number != next_part || expected_offset != uploaded {
            return Err(Error::OffsetMismatch {
                expected: expected_offset,
                current: uploaded,
            });
        }
        if uploaded + size > session.size {
            return Err(Error::InvalidInput(format!(
                "part of {} bytes at offset {} exceeds declared size {}",
                size, uploaded, session.size
            )));
        }
        let is_last = uploaded + size == session.size;
        if !is_last && size < MULTIPART_MIN_PART_SIZE {
            return Err(Error::InvalidInput(format!(
                "non-final parts must be at least {} bytes",
                MULTIPART_MIN_PART_SIZE
            )));
        }

        let upload_url = direct
            .presign_upload_part_url(storage_key, upload_id, part_number, presign_expiry())
            .await?;
        self.db.upload_sessions.touch(id).await?;

        Ok(PartUploadUrl {
            upload_url,
            part_number,
            offset: uploaded,
            size,
        })
    }

    /// Store the client's thumbnail source for a session.
    pub async fn upload_session_thumbnail(
        &self,
        viewer: Option<i64>,
        id: &str,
        data: Bytes,
    ) -> Result<()> {
        let session = self.owned_session(viewer, id).await?;
        if data.is_empty() {
            return Err(Error::InvalidInput("empty thumbnail".into()));
        }
        if data.len() as i64 > THUMBNAIL_UPLOAD_MAX_BYTES {
            return Err(Error::InvalidInput(format!(
                "thumbnail exceeds {} bytes",
                THUMBNAIL_UPLOAD_MAX_BYTES
            )));
        }

        fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(format!("{}.thumb", session.id));
        fs::write(&path, &data).await?;
        let path_str = path.to_string_lossy().into_owned();
        if !self
            .db
            .upload_sessions
            .set_thumbnail_temp_path(&session.id, &path_str)
            .await?
        {
            remove_scratch_file(&path).await?;
            return Err(Error::NotFound(format!("upload session {}", id)));
        }
        Ok(())
    }

    /// Commit a session into an attachment.
    pub async fn complete_upload_session(&self, viewer: Option<i64>, id: &str) -> Result<Attachment> {
        let start = Instant::now();
        let _session_guard = self.session_locks.lock(id).await;
        let session = self.owned_session(viewer, id).await?;
        let setting = self.storage_setting().await?;
        let memo_id = self
            .resolve_memo_link(session.creator_id, session.memo_name.as_deref())
            .await?;

        let (backend, content_hash, storage_key, fresh, object_guard) = match &session.target {
            UploadTarget::Local { temp_path } => {
                if session.received_size != session.size {
                    return Err(Error::UploadIncomplete {
                        received: session.received_size,
                        size: session.size,
                    });
                }
                let (content_hash, len) = ContentHasher::hash_file(temp_path).await?;
                if len as i64 != session.size {
                    return Err(Error::UploadIncomplete {
                        received: len as i64,
                        size: session.size,
                    });
                }
                let backend = self.storage.resolve(&setting)?;
                match self
                    .claim_reusable_object(backend.as_ref(), session.creator_id, &content_hash)
                    .await?
                {
                    Some((key, guard)) => (backend, content_hash, key, false, Some(guard)),
                    None => {
                        let key = self
                            .allocate_storage_key(backend.as_ref(), &session.filename)
                            .await?;
                        let file = fs::File::open(temp_path).await?;
                        backend
                            .put_stream(&key, &session.content_type, Box::pin(file), session.size as u64)
                            .await?;
                        (backend, content_hash, key, true, None)
                    }
                }
            }
            UploadTarget::S3Direct { storage_key } => {
                let backend = self.s3_backend(&setting)?;
                let direct = backend
                    .direct_upload()
                    .ok_or_else(|| Error::Unsupported("backend has no direct upload".into()))?;
                let stored = match direct.head_size(storage_key).await {
                    Ok(size) => size,
                    Err(Error::NotFound(_)) => 0,
                    Err(e) => return Err(e),
                };
                if stored != session.size {
                    return Err(Error::UploadIncomplete {
                        received: stored,
                        size: session.size,
                    });
                }
                let hash = synthetic_hash(session.creator_id, &session.id, storage_key, session.size, &[]);
                (backend, hash, storage_key.clone(), false, None)
            }
            UploadTarget::S3Multipart {
                storage_key,
                upload_id,
                ..
            } => {
                let backend = self.s3_backend(&setting)?;
                let direct = backend
                    .direct_upload()
                    .ok_or_else(|| Error::Unsupported("backend has no multipart support".into()))?;
                let parts = direct.list_multipart_uploaded_parts(storage_key, upload_id).await?;
                let (prefix, uploaded) = contiguous_prefix(&parts);
                if uploaded != session.size {
                    return Err(Error::UploadIncomplete {
                        received: uploaded,
                        size: session.size,
                    });
                }
                direct
                    .complete_multipart_upload(storage_key, upload_id, &prefix)
                    .await?;
                let hash = synthetic_hash(session.creator_id, upload_id, storage_key, session.size, &prefix);
                (backend, hash, storage_key.clone(), false, None)
            }
        };

        let attachment = self
            .insert_attachment(
                backend.as_ref(),
                NewAttachment {
                    uid: random_id(UID_LENGTH),
                    creator_id: session.creator_id,
                    filename: session.filename.clone(),
                    content_type: session.content_type.clone(),
                    size: session.size,
                    content_hash,
                    storage_type: backend.storage_type(),
                    storage_key,
                    memo_id,
                },
                fresh,
            )
            .await?;
        drop(object_guard);

        let thumbnail_upload = session
            .thumbnail_temp_path
            .as_deref()
            .map(Path::new)
            .filter(|p| p.is_file());
        let source = match (thumbnail_upload, &session.target) {
            (Some(path), _) => ThumbnailSource::File {
                path,
                max_bytes: THUMBNAIL_UPLOAD_MAX_BYTES,
            },
            (None, UploadTarget::Local { temp_path }) => ThumbnailSource::File {
                path: Path::new(temp_path),
                max_bytes: THUMBNAIL_SOURCE_MAX_BYTES,
            },
            (None, _) => ThumbnailSource::Stored,
        };
        let attachment = self.ensure_thumbnail(attachment, &setting, source).await;

        self.db.upload_sessions.delete(&session.id).await?;
        if let UploadTarget::Local { temp_path } = &session.target {
            if let Err(e) = remove_scratch_file(Path::new(temp_path)).await {
                warn!(subsystem = "upload", session_id = %session.id, error = %e, "Failed to remove scratch file");
            }
        }
        if let Some(path) = &session.thumbnail_temp_path {
            if let Err(e) = remove_scratch_file(Path::new(path)).await {
                warn!(subsystem = "upload", session_id = %session.id, error = %e, "Failed to remove thumbnail scratch file");
            }
        }

        info!(
            subsystem = "upload",
            op = "complete_session",
            session_id = %session.id,
            attachment_id = attachment.id,
            mode = session.target.mode(),
            size_bytes = session.size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Completed upload session"
        );
        Ok(attachment)
    }

    /// Drop a session. The row goes first so the session is never seen
    /// active again; the backing resources are released best-effort.
    pub async fn cancel_upload_session(&self, viewer: Option<i64>, id: &str) -> Result<()> {
        let _session_guard = self.session_locks.lock(id).await;
        let session = self.owned_session(viewer, id).await?;
        if !self.db.upload_sessions.delete(&session.id).await? {
            return Err(Error::NotFound(format!("upload session {}", id)));
        }
        if let Err(e) = self.release_session_resources(&session).await {
            warn!(
                subsystem = "upload",
                op = "cancel_session",
                session_id = %session.id,
                error = %e,
                "Failed to release upload resources"
            );
        }
        info!(subsystem = "upload", op = "cancel_session", session_id = %session.id, "Cancelled upload session");
        Ok(())
    }

    /// Remove scratch files and abandoned objects of a deleted session.
    /// Every step is attempted; the first error is returned.
    async fn release_session_resources(&self, session: &AttachmentUploadSession) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Some(path) = &session.thumbnail_temp_path {
            if let Err(e) = remove_scratch_file(Path::new(path)).await {
                first_error.get_or_insert(e);
            }
        }

        let released = match &session.target {
            UploadTarget::Local { temp_path } => remove_scratch_file(Path::new(temp_path)).await,
            UploadTarget::S3Direct { storage_key } => {
                self.release_direct_object(storage_key).await
            }
            UploadTarget::S3Multipart {
                storage_key,
                upload_id,
                ..
            } => self.abort_multipart(storage_key, upload_id).await,
        };
        if let Err(e) = released {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn release_direct_object(&self, storage_key: &str) -> Result<()> {
        // A completed session whose row survived may already back an attachment.
        if self.db.attachments.storage_key_in_use(storage_key).await? {
            return Ok(());
        }
        let setting = self.storage_setting().await?;
        self.s3_backend(&setting)?.delete(storage_key).await
    }

    async fn abort_multipart(&self, storage_key: &str, upload_id: &str) -> Result<()> {
        let setting = self.storage_setting().await?;
        let backend = self.s3_backend(&setting)?;
        let direct = backend
            .direct_upload()
            .ok_or_else(|| Error::Unsupported("backend has no multipart support".into()))?;
        direct.abort_multipart_upload(storage_key, upload_id).await
    }

    /// Sweep sessions idle for longer than the session TTL.
    ///
    /// Works in batches until a batch comes back short. Each row is deleted
    /// before its resources are released; all sessions are attempted and
    /// the first error is reported. Returns the number of sessions removed.
    pub async fn cleanup_expired_upload_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::seconds(UPLOAD_SESSION_TTL_SECS);
        let mut removed = 0usize;
        let mut first_error: Option<Error> = None;

        loop {
            let batch = self
                .db
                .upload_sessions
                .list_expired(cutoff, UPLOAD_SESSION_CLEANUP_BATCH)
                .await?;
            let batch_len = batch.len() as i64;
            let mut stalled = false;

            for session in batch {
                match self.db.upload_sessions.delete(&session.id).await {
                    Ok(true) => {
                        removed += 1;
                        if let Err(e) = self.release_session_resources(&session).await {
                            warn!(
                                subsystem = "upload",
                                component = "janitor",
                                session_id = %session.id,
                                error = %e,
                                "Failed to release expired upload resources"
                            );
                            first_error.get_or_insert(e);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        stalled = true;
                        first_error.get_or_insert(e);
                    }
                }
            }

            // A failing delete would hand back the same rows forever.
            if batch_len < UPLOAD_SESSION_CLEANUP_BATCH || stalled {
                break;
            }
        }

        if removed > 0 {
            info!(
                subsystem = "upload",
                component = "janitor",
                result_count = removed,
                "Removed expired upload sessions"
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    // =========================================================================
    // ATTACHMENTS
    // =========================================================================

    /// Visible to its creator, and to anyone who can see the linked memo.
    pub async fn get_attachment(&self, viewer: Option<i64>, uid: &str) -> Result<Attachment> {
        let not_found = || Error::NotFound(format!("attachment {}", uid));
        let attachment = self.db.attachments.get_by_uid(uid).await?.ok_or_else(not_found)?;
        if viewer == Some(attachment.creator_id) {
            return Ok(attachment);
        }
        let Some(memo_id) = attachment.memo_id else {
            return Err(not_found());
        };
        match self.db.memos.get_by_id(memo_id).await? {
            Some(memo) if memo.is_visible_to(viewer) => Ok(attachment),
            _ => Err(not_found()),
        }
    }

    pub async fn list_attachments(&self, viewer: Option<i64>) -> Result<Vec<Attachment>> {
        let creator_id = require_viewer(viewer)?;
        self.db.attachments.list_by_creator(creator_id).await
    }

    /// Read an attachment or its thumbnail, whole or by range. With
    /// `redirect`, object-store backends answer with a presigned GET URL.
    pub async fn open_attachment(
        &self,
        viewer: Option<i64>,
        uid: &str,
        range: Option<ByteRange>,
        thumbnail: bool,
        redirect: bool,
    ) -> Result<AttachmentContent> {
        let attachment = self.get_attachment(viewer, uid).await?;
        let setting = self.storage_setting().await?;
        let backend = self.storage.backend_for(attachment.storage_type, &setting)?;

        let (storage_key, filename, content_type, total_size) = match (&attachment.thumbnail, thumbnail) {
            (Some(thumb), true) => (
                thumb.storage_key.clone(),
                thumb.filename.clone(),
                thumb.content_type.clone(),
                thumb.size,
            ),
            _ => (
                attachment.storage_key.clone(),
                attachment.filename.clone(),
                attachment.content_type.clone(),
                attachment.size,
            ),
        };

        if redirect {
            if let Some(direct) = backend.direct_upload() {
                let url = direct
                    .presign_get_object_url(&storage_key, presign_expiry())
                    .await?;
                return Ok(AttachmentContent::Redirect(url));
            }
        }

        let total_size = total_size.max(0) as u64;
        let (reader, range) = match range {
            None => (backend.open(&storage_key).await?, None),
            Some(requested) => {
                let (start, end) = requested.resolve(total_size)?;
                (
                    backend.open_range(&storage_key, start, Some(end)).await?,
                    Some((start, end)),
                )
            }
        };
        Ok(AttachmentContent::Stream {
            filename,
            content_type,
            total_size,
            range,
            reader,
        })
    }

    /// Delete an attachment row. Its object and thumbnail are removed once
    /// no other row shares the storage key.
    pub async fn delete_attachment(&self, viewer: Option<i64>, uid: &str) -> Result<()> {
        let creator_id = require_viewer(viewer)?;
        let attachment = match self.db.attachments.get_by_uid(uid).await? {
            Some(a) if a.creator_id == creator_id => a,
            _ => return Err(Error::NotFound(format!("attachment {}", uid))),
        };
        let _object_guard = self
            .object_locks
            .lock(&object_lock_key(attachment.storage_type, &attachment.storage_key))
            .await;
        if !self.db.attachments.delete(attachment.id).await? {
            return Err(Error::NotFound(format!("attachment {}", uid)));
        }

        let remaining = self
            .db
            .attachments
            .count_by_storage_key(attachment.storage_type, &attachment.storage_key)
            .await?;
        if remaining == 0 {
            let setting = self.storage_setting().await?;
            let backend = self.storage.backend_for(attachment.storage_type, &setting)?;
            let mut keys = vec![attachment.storage_key.clone()];
            if let Some(thumb) = &attachment.thumbnail {
                keys.push(thumb.storage_key.clone());
            }
            for key in keys {
                if let Err(e) = backend.delete(&key).await {
                    warn!(
                        subsystem = "storage",
                        op = "delete_attachment",
                        storage_key = %key,
                        error = %e,
                        "Failed to delete object"
                    );
                }
            }
        }

        info!(
            subsystem = "upload",
            op = "delete_attachment",
            attachment_id = attachment.id,
            viewer_id = creator_id,
            object_removed = remaining == 0,
            "Deleted attachment"
        );
        Ok(())
    }

    // =========================================================================
    // THUMBNAILS
    // =========================================================================

    /// Attach a thumbnail to an image attachment. Never fails the caller:
    /// errors are logged and the attachment is returned unchanged.
    async fn ensure_thumbnail(
        &self,
        attachment: Attachment,
        setting: &StorageSetting,
        source: ThumbnailSource<'_>,
    ) -> Attachment {
        if attachment.thumbnail.is_some()
            || !thumbnail::is_thumbnailable(&attachment.content_type, &attachment.filename)
        {
            return attachment;
        }
        match self.try_ensure_thumbnail(&attachment, setting, source).await {
            Ok(Some(thumb)) => Attachment {
                thumbnail: Some(thumb),
                ..attachment
            },
            Ok(None) => attachment,
            Err(e) => {
                warn!(
                    subsystem = "upload",
                    op = "thumbnail",
                    attachment_id = attachment.id,
                    error = %e,
                    "Thumbnail skipped"
                );
                attachment
            }
        }
    }

    async fn try_ensure_thumbnail(
        &self,
        attachment: &Attachment,
        setting: &StorageSetting,
        source: ThumbnailSource<'_>,
    ) -> Result<Option<AttachmentThumbnail>> {
        let _guard = self
            .thumbnail_locks
            .lock(&object_lock_key(attachment.storage_type, &attachment.storage_key))
            .await;

        if let Some(shared) = self
            .db
            .attachments
            .find_shared_thumbnail(attachment.storage_type, &attachment.storage_key)
            .await?
        {
            self.db.attachments.set_thumbnail(attachment.id, &shared).await?;
            return Ok(Some(shared));
        }

        let backend = self.storage.backend_for(attachment.storage_type, setting)?;
        let Some(bytes) = self
            .load_thumbnail_source(attachment, backend.as_ref(), source)
            .await?
        else {
            return Ok(None);
        };

        let jpeg = thumbnail::generate_async(bytes).await?;
        let key = thumbnail::thumbnail_key(&attachment.storage_key);
        let size = backend
            .put(&key, thumbnail::THUMBNAIL_CONTENT_TYPE, Bytes::from(jpeg))
            .await?;
        let thumb = AttachmentThumbnail {
            filename: thumbnail::thumbnail_filename(&attachment.filename),
            content_type: thumbnail::THUMBNAIL_CONTENT_TYPE.to_string(),
            size: size as i64,
            storage_key: key,
        };
        self.db.attachments.set_thumbnail(attachment.id, &thumb).await?;
        debug!(
            subsystem = "upload",
            op = "thumbnail",
            attachment_id = attachment.id,
            size_bytes = thumb.size,
            "Stored thumbnail"
        );
        Ok(Some(thumb))
    }

    async fn load_thumbnail_source(
        &self,
        attachment: &Attachment,
        backend: &dyn StorageBackend,
        source: ThumbnailSource<'_>,
    ) -> Result<Option<Vec<u8>>> {
        match source {
            ThumbnailSource::Bytes(data) => {
                if data.len() as i64 > THUMBNAIL_SOURCE_MAX_BYTES {
                    return Ok(None);
                }
                Ok(Some(data.to_vec()))
            }
            ThumbnailSource::File { path, max_bytes } => {
                if fs::metadata(path).await?.len() as i64 > max_bytes {
                    return Ok(None);
                }
                Ok(Some(fs::read(path).await?))
            }
            ThumbnailSource::Stored => {
                if attachment.size > THUMBNAIL_SOURCE_MAX_BYTES {
                    return Ok(None);
                }
                let reader = backend.open(&attachment.storage_key).await?;
                let mut buf = Vec::with_capacity(attachment.size.max(0) as usize);
                reader
                    .take(THUMBNAIL_SOURCE_MAX_BYTES as u64 + 1)
                    .read_to_end(&mut buf)
                    .await?;
                if buf.len() as i64 > THUMBNAIL_SOURCE_MAX_BYTES {
                    return Ok(None);
                }
                Ok(Some(buf))
            }
        }
    }
}

/// Progress as recorded on the session row.
fn initial_progress(session: &AttachmentUploadSession) -> UploadSessionProgress {
    let (received_size, part_size, next_part_number) = match &session.target {
        UploadTarget::Local { .. } => (session.received_size, None, None),
        UploadTarget::S3Direct { .. } => (0, None, None),
        UploadTarget::S3Multipart { part_size, .. } => (0, Some(*part_size), Some(1)),
    };
    UploadSessionProgress {
        session_id: session.id.clone(),
        mode: session.target.mode(),
        size: session.size,
        received_size,
        part_size,
        next_part_number,
    }
}
