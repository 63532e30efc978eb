//! Core data models for memos-server.
//!
//! These types are shared across all memos-server crates and represent
//! the core domain entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tags::parse_collab_tag;

/// Resource name prefix for memos (`memos/<uid>`).
pub const MEMO_NAME_PREFIX: &str = "memos/";

/// Resource name prefix for attachments (`attachments/<uid>`).
pub const ATTACHMENT_NAME_PREFIX: &str = "attachments/";

// =============================================================================
// MEMO ENUMS
// =============================================================================

/// Who may see a memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// Creator and explicit collaborators only.
    Private,
    /// Any signed-in user.
    Protected,
    /// Everyone, including anonymous viewers.
    Public,
}

impl Visibility {
    pub const ALL: [Visibility; 3] = [Self::Private, Self::Protected, Self::Public];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "PRIVATE",
            Self::Protected => "PROTECTED",
            Self::Public => "PUBLIC",
        }
    }

    /// Parse the canonical upper-case name; `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRIVATE" => Some(Self::Private),
            "PROTECTED" => Some(Self::Protected),
            "PUBLIC" => Some(Self::Public),
            _ => None,
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidInput(format!("invalid visibility: {}", s)))
    }
}

/// Lifecycle state of a memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoState {
    Normal,
    Archived,
}

impl MemoState {
    pub const ALL: [MemoState; 2] = [Self::Normal, Self::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(Self::Normal),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidInput(format!("invalid state: {}", s)))
    }
}

// =============================================================================
// MEMO TYPES
// =============================================================================

/// Flags derived from memo content, persisted for SQL-level filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoProperty {
    pub has_link: bool,
    pub has_task_list: bool,
    pub has_code: bool,
    pub has_incomplete_tasks: bool,
}

/// Geographic location attached to a memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub placeholder: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Reject coordinates outside [-90, 90] / [-180, 180].
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::InvalidInput(format!(
                "latitude must be between -90 and 90, got {}",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::InvalidInput(format!(
                "longitude must be between -180 and 180, got {}",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// A memo with all persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub id: i64,
    pub uid: String,
    pub creator_id: i64,
    pub content: String,
    pub visibility: Visibility,
    pub state: MemoState,
    pub pinned: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub tags: Vec<String>,
    pub property: MemoProperty,
}

impl Memo {
    /// Resource name, `memos/<uid>`.
    pub fn name(&self) -> String {
        format!("{}{}", MEMO_NAME_PREFIX, self.uid)
    }

    /// User IDs granted access through `collab/<userID>` tags.
    pub fn collaborators(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .tags
            .iter()
            .filter_map(|t| parse_collab_tag(t))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether `viewer` holds a collaboration tag on this memo.
    pub fn is_collaborator(&self, viewer: i64) -> bool {
        self.tags.iter().any(|t| parse_collab_tag(t) == Some(viewer))
    }

    /// The visibility rule shared by listing, sync and direct reads.
    ///
    /// Anonymous viewers see PUBLIC memos only; signed-in viewers see their
    /// own memos, PUBLIC and PROTECTED memos, and memos they collaborate on.
    pub fn is_visible_to(&self, viewer: Option<i64>) -> bool {
        match viewer {
            None => self.visibility == Visibility::Public,
            Some(v) => {
                self.creator_id == v
                    || matches!(self.visibility, Visibility::Public | Visibility::Protected)
                    || self.is_collaborator(v)
            }
        }
    }

    /// Creator and collaborators may edit and delete.
    pub fn can_modify(&self, viewer: i64) -> bool {
        self.creator_id == viewer || self.is_collaborator(viewer)
    }
}

/// Parse `memos/<uid>` into its uid.
pub fn parse_memo_name(name: &str) -> Result<&str> {
    parse_resource_name(name, MEMO_NAME_PREFIX)
}

/// Parse `attachments/<uid>` into its uid.
pub fn parse_attachment_name(name: &str) -> Result<&str> {
    parse_resource_name(name, ATTACHMENT_NAME_PREFIX)
}

fn parse_resource_name<'a>(name: &'a str, prefix: &str) -> Result<&'a str> {
    let uid = name
        .strip_prefix(prefix)
        .ok_or_else(|| Error::InvalidInput(format!("invalid resource name: {}", name)))?;
    if uid.is_empty()
        || !uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!("invalid resource name: {}", name)));
    }
    Ok(uid)
}

/// Request for creating a memo.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateMemo {
    pub content: String,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Row to insert for a new memo; tags normalised, properties computed.
#[derive(Debug, Clone)]
pub struct NewMemo {
    pub uid: String,
    pub creator_id: i64,
    pub content: String,
    pub visibility: Visibility,
    pub state: MemoState,
    pub pinned: bool,
    pub tags: Vec<String>,
    pub location: Option<Location>,
    pub property: MemoProperty,
}

/// Partial update of a memo. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMemo {
    pub content: Option<String>,
    pub visibility: Option<Visibility>,
    pub state: Option<MemoState>,
    pub pinned: Option<bool>,
    pub tags: Option<Vec<String>>,
    /// `Some(None)` clears the location.
    #[serde(default, with = "double_option")]
    pub location: Option<Option<Location>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// One page of `list_memos`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoPage {
    pub memos: Vec<Memo>,
    /// Empty when there are no further pages.
    pub next_page_token: String,
}

/// Result of an incremental sync window.
#[derive(Debug, Clone, Serialize)]
pub struct MemoChanges {
    /// Visible memos updated in the window, oldest update first.
    pub memos: Vec<Memo>,
    /// Memos deleted or no longer visible to the viewer within the window.
    pub deleted_memo_names: Vec<String>,
    /// Upper bound of the window; the client's next `since`.
    pub sync_anchor: DateTime<Utc>,
}

// =============================================================================
// CHANGE EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoChangeEventType {
    Delete,
    VisibilityRevoked,
}

impl MemoChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::VisibilityRevoked => "VISIBILITY_REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DELETE" => Some(Self::Delete),
            "VISIBILITY_REVOKED" => Some(Self::VisibilityRevoked),
            _ => None,
        }
    }
}

/// Append-only record telling recipients a memo left their view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoChangeEvent {
    pub id: i64,
    pub memo_id: i64,
    pub memo_name: String,
    pub creator_id: i64,
    pub event_type: MemoChangeEventType,
    pub event_time: DateTime<Utc>,
    pub recipients: Vec<i64>,
}

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// Where an attachment's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    Local,
    S3,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::S3 => "S3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOCAL" => Some(Self::Local),
            "S3" => Some(Self::S3),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thumbnail sidecar of an image attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentThumbnail {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing)]
    pub storage_key: String,
}

/// Attachment metadata. Rows are never shared; backing objects may be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub uid: String,
    pub creator_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub content_hash: String,
    pub storage_type: StorageType,
    #[serde(skip_serializing)]
    pub storage_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<AttachmentThumbnail>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Attachment {
    /// Resource name, `attachments/<uid>`.
    pub fn name(&self) -> String {
        format!("{}{}", ATTACHMENT_NAME_PREFIX, self.uid)
    }
}

/// Row to insert for a new attachment.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub uid: String,
    pub creator_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub content_hash: String,
    pub storage_type: StorageType,
    pub storage_key: String,
    pub memo_id: Option<i64>,
}

/// Request for an inline attachment upload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAttachment {
    pub filename: String,
    /// Sniffed from the payload when absent.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64-encoded payload.
    pub content: String,
    /// Memo (`memos/<uid>`) to link the attachment to.
    #[serde(default)]
    pub memo_name: Option<String>,
}

// =============================================================================
// UPLOAD SESSIONS
// =============================================================================

const S3_DIRECT_MARKER: &str = "s3-direct:";
const S3_MULTIPART_MARKER: &str = "s3-multipart:";

/// Where the bytes of an upload session accumulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UploadTarget {
    /// Server-side scratch file written by chunk appends.
    Local { temp_path: String },
    /// Client PUTs the whole object to a presigned URL.
    S3Direct { storage_key: String },
    /// Client uploads presigned parts of a multipart upload.
    S3Multipart {
        storage_key: String,
        upload_id: String,
        part_size: i64,
    },
}

#[derive(Serialize, Deserialize)]
struct MultipartMarker {
    storage_key: String,
    upload_id: String,
    part_size: i64,
}

impl UploadTarget {
    /// Encode into the single persisted temp-path column.
    pub fn encode(&self) -> String {
        match self {
            Self::Local { temp_path } => temp_path.clone(),
            Self::S3Direct { storage_key } => format!("{}{}", S3_DIRECT_MARKER, storage_key),
            Self::S3Multipart {
                storage_key,
                upload_id,
                part_size,
            } => {
                let marker = MultipartMarker {
                    storage_key: storage_key.clone(),
                    upload_id: upload_id.clone(),
                    part_size: *part_size,
                };
                // Serializing a struct of strings and an integer cannot fail.
                let json = serde_json::to_string(&marker).unwrap_or_default();
                format!("{}{}", S3_MULTIPART_MARKER, json)
            }
        }
    }

    /// Decode the persisted temp-path column.
    pub fn decode(raw: &str) -> Result<Self> {
        if let Some(key) = raw.strip_prefix(S3_DIRECT_MARKER) {
            if key.is_empty() {
                return Err(Error::Internal("empty s3 direct storage key".into()));
            }
            return Ok(Self::S3Direct {
                storage_key: key.to_string(),
            });
        }
        if let Some(json) = raw.strip_prefix(S3_MULTIPART_MARKER) {
            let marker: MultipartMarker = serde_json::from_str(json)?;
            return Ok(Self::S3Multipart {
                storage_key: marker.storage_key,
                upload_id: marker.upload_id,
                part_size: marker.part_size,
            });
        }
        if raw.is_empty() {
            return Err(Error::Internal("upload session has no target".into()));
        }
        Ok(Self::Local {
            temp_path: raw.to_string(),
        })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3Direct { .. } => "s3_direct",
            Self::S3Multipart { .. } => "s3_multipart",
        }
    }
}

/// A transient resumable upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentUploadSession {
    pub id: String,
    pub creator_id: i64,
    pub filename: String,
    pub content_type: String,
    /// Declared total size.
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_name: Option<String>,
    pub target: UploadTarget,
    pub received_size: i64,
    #[serde(skip_serializing)]
    pub thumbnail_temp_path: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Row to insert for a new upload session.
#[derive(Debug, Clone)]
pub struct NewUploadSession {
    pub id: String,
    pub creator_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub memo_name: Option<String>,
    pub target: UploadTarget,
}

/// Request for a resumable upload session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUploadSession {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Declared total size in bytes.
    pub size: i64,
    #[serde(default)]
    pub memo_name: Option<String>,
}

/// Authoritative progress of an upload session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSessionProgress {
    pub session_id: String,
    pub mode: &'static str,
    pub size: i64,
    pub received_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_part_number: Option<i32>,
}

/// A part reported by the object store for a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub size: i64,
    pub etag: String,
}

// =============================================================================
// WORKSPACE SETTINGS
// =============================================================================

/// Connection settings of an S3-compatible object store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    #[serde(default)]
    pub use_path_style: bool,
}

/// Workspace-wide storage selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSetting {
    pub storage_type: StorageType,
    #[serde(default = "default_upload_size_limit_mb")]
    pub upload_size_limit_mb: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_config: Option<S3Config>,
}

fn default_upload_size_limit_mb() -> i64 {
    crate::defaults::UPLOAD_SIZE_LIMIT_MB
}

impl Default for StorageSetting {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Local,
            upload_size_limit_mb: default_upload_size_limit_mb(),
            s3_config: None,
        }
    }
}

impl StorageSetting {
    pub fn upload_size_limit_bytes(&self) -> i64 {
        self.upload_size_limit_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn memo(creator_id: i64, visibility: Visibility, tags: &[&str]) -> Memo {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Memo {
            id: 1,
            uid: "abc".into(),
            creator_id,
            content: String::new(),
            visibility,
            state: MemoState::Normal,
            pinned: false,
            create_time: ts,
            update_time: ts,
            location: None,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            property: MemoProperty::default(),
        }
    }

    #[test]
    fn test_visibility_round_trip_names() {
        for v in Visibility::ALL {
            assert_eq!(Visibility::parse(v.as_str()), Some(v));
        }
        assert_eq!(Visibility::parse("public"), None);
    }

    #[test]
    fn test_private_memo_visible_to_creator_and_collaborator_only() {
        let m = memo(1, Visibility::Private, &["collab/7", "work"]);
        assert!(m.is_visible_to(Some(1)));
        assert!(m.is_visible_to(Some(7)));
        assert!(!m.is_visible_to(Some(2)));
        assert!(!m.is_visible_to(None));
    }

    #[test]
    fn test_protected_memo_hidden_from_anonymous() {
        let m = memo(1, Visibility::Protected, &[]);
        assert!(m.is_visible_to(Some(2)));
        assert!(!m.is_visible_to(None));
        assert!(memo(1, Visibility::Public, &[]).is_visible_to(None));
    }

    #[test]
    fn test_collab_prefix_hierarchy_does_not_grant_access() {
        let m = memo(1, Visibility::Private, &["collab/7/notes", "collab"]);
        assert!(!m.is_visible_to(Some(7)));
        assert!(m.collaborators().is_empty());
    }

    #[test]
    fn test_can_modify() {
        let m = memo(1, Visibility::Public, &["collab/3"]);
        assert!(m.can_modify(1));
        assert!(m.can_modify(3));
        assert!(!m.can_modify(4));
    }

    #[test]
    fn test_location_validation() {
        let ok = Location {
            placeholder: String::new(),
            latitude: 45.0,
            longitude: -120.0,
        };
        assert!(ok.validate().is_ok());
        let bad_lat = Location {
            latitude: 91.0,
            ..ok.clone()
        };
        assert!(bad_lat.validate().is_err());
        let bad_lng = Location {
            longitude: 180.5,
            ..ok
        };
        assert!(bad_lng.validate().is_err());
    }

    #[test]
    fn test_parse_memo_name() {
        assert_eq!(parse_memo_name("memos/abc123").unwrap(), "abc123");
        assert!(parse_memo_name("memos/").is_err());
        assert!(parse_memo_name("attachments/abc").is_err());
        assert!(parse_memo_name("memos/../x").is_err());
    }

    #[test]
    fn test_upload_target_encoding() {
        let targets = [
            UploadTarget::Local {
                temp_path: "/tmp/upload/abc".into(),
            },
            UploadTarget::S3Direct {
                storage_key: "attachments/ab/abc".into(),
            },
            UploadTarget::S3Multipart {
                storage_key: "attachments/ab/abc".into(),
                upload_id: "upload-1".into(),
                part_size: 8 * 1024 * 1024,
            },
        ];
        for target in targets {
            assert_eq!(UploadTarget::decode(&target.encode()).unwrap(), target);
        }
        assert!(UploadTarget::decode("").is_err());
        assert!(UploadTarget::decode("s3-multipart:{not json").is_err());
    }

    #[test]
    fn test_update_memo_location_tristate() {
        let untouched: UpdateMemo = serde_json::from_str("{}").unwrap();
        assert!(untouched.location.is_none());
        let cleared: UpdateMemo = serde_json::from_str(r#"{"location": null}"#).unwrap();
        assert_eq!(cleared.location, Some(None));
    }

    #[test]
    fn test_storage_setting_defaults() {
        let setting: StorageSetting = serde_json::from_str(r#"{"storage_type":"LOCAL"}"#).unwrap();
        assert_eq!(setting, StorageSetting::default());
        assert_eq!(setting.upload_size_limit_bytes(), 30 * 1024 * 1024);
    }
}
