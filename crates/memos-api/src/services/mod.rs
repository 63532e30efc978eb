//! Service layer for business logic.

pub mod attachment_service;
pub mod keyed_mutex;
pub mod memo_service;
pub mod storage;
pub mod thumbnail;
pub mod upload_janitor;

pub use attachment_service::{
    AttachmentContent, AttachmentService, ByteRange, PartUploadUrl, UploadTicket,
};
pub use keyed_mutex::KeyedMutex;
pub use memo_service::MemoService;
pub use storage::StorageResolver;
pub use upload_janitor::{JanitorHandle, UploadJanitor};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric identifier of `len` characters.
pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
