//! Integration tests for S3 direct and multipart upload sessions against an
//! in-memory object store.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use memos_api::services::{AttachmentContent, AttachmentService, StorageResolver};
use memos_core::defaults::MULTIPART_MIN_PART_SIZE;
use memos_core::{
    CreateUploadSession, Error, Result, StorageType, UploadTarget, UploadedPart,
};
use memos_db::test_fixtures::TestDatabase;
use memos_db::{BoxedReader, DirectUpload, StorageBackend};

// =============================================================================
// IN-MEMORY OBJECT STORE
// =============================================================================

#[derive(Default)]
struct FakeObjectStore {
    multipart: bool,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, (String, Vec<UploadedPart>)>>,
    completed: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
}

impl FakeObjectStore {
    fn new(multipart: bool) -> Arc<Self> {
        Arc::new(Self {
            multipart,
            ..Self::default()
        })
    }

    /// What a client PUT to a presigned part URL would leave behind.
    fn upload_part(&self, upload_id: &str, part_number: i32, size: i64) {
        let mut uploads = self.uploads.lock().unwrap();
        let (_, parts) = uploads.get_mut(upload_id).expect("unknown upload");
        parts.retain(|p| p.part_number != part_number);
        parts.push(UploadedPart {
            part_number,
            size,
            etag: format!("\"etag-{}\"", part_number),
        });
    }

    fn put_object(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    fn has_object(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

#[async_trait]
impl StorageBackend for FakeObjectStore {
    async fn put(&self, key: &str, _content_type: &str, data: Bytes) -> Result<u64> {
        self.put_object(key, &data);
        Ok(data.len() as u64)
    }

    async fn put_stream(
        &self,
        key: &str,
        _content_type: &str,
        mut reader: BoxedReader,
        declared_size: u64,
    ) -> Result<u64> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != declared_size {
            return Err(Error::InvalidInput("size mismatch".into()));
        }
        self.put_object(key, &buf);
        Ok(declared_size)
    }

    async fn open(&self, key: &str) -> Result<BoxedReader> {
        Ok(Box::pin(Cursor::new(self.get(key)?)))
    }

    async fn open_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<BoxedReader> {
        let data = self.get(key)?;
        let end = end.map_or(data.len(), |e| (e as usize + 1).min(data.len()));
        Ok(Box::pin(Cursor::new(data[start as usize..end].to_vec())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.has_object(key))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    fn direct_upload(&self) -> Option<&dyn DirectUpload> {
        Some(self)
    }
}

#[async_trait]
impl DirectUpload for FakeObjectStore {
    async fn head_size(&self, key: &str) -> Result<i64> {
        Ok(self.get(key)?.len() as i64)
    }

    async fn presign_put_object_url(
        &self,
        key: &str,
        _content_type: &str,
        _expires_in: Duration,
    ) -> Result<String> {
        Ok(format!("https://store.test/{}?put", key))
    }

    async fn presign_get_object_url(&self, key: &str, _expires_in: Duration) -> Result<String> {
        Ok(format!("https://store.test/{}?get", key))
    }

    async fn create_multipart_upload(&self, key: &str, _content_type: &str) -> Result<String> {
        if !self.multipart {
            return Err(Error::Unsupported("multipart disabled".into()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        let upload_id = format!("upload-{}", uploads.len() + 1);
        uploads.insert(upload_id.clone(), (key.to_string(), Vec::new()));
        Ok(upload_id)
    }

    async fn presign_upload_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        _expires_in: Duration,
    ) -> Result<String> {
        Ok(format!(
            "https://store.test/{}?uploadId={}&partNumber={}",
            key, upload_id, part_number
        ))
    }

    async fn list_multipart_uploaded_parts(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>> {
        let uploads = self.uploads.lock().unwrap();
        let (_, parts) = uploads
            .get(upload_id)
            .ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
        let mut parts = parts.clone();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let total: i64 = parts.iter().map(|p| p.size).sum();
        self.uploads.lock().unwrap().remove(upload_id);
        self.put_object(key, &vec![0u8; total as usize]);
        self.completed.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

async fn service(store: &Arc<FakeObjectStore>) -> (TestDatabase, AttachmentService) {
    let test_db = TestDatabase::new().await;
    let service = AttachmentService::new(
        test_db.db.clone(),
        StorageResolver::fixed(store.clone()),
        test_db.subdir("uploads"),
    );
    (test_db, service)
}

fn request(filename: &str, size: i64) -> CreateUploadSession {
    CreateUploadSession {
        filename: filename.to_string(),
        content_type: Some("application/octet-stream".into()),
        size,
        memo_name: None,
    }
}

fn multipart_ids(target: &UploadTarget) -> (String, String) {
    match target {
        UploadTarget::S3Multipart {
            storage_key,
            upload_id,
            ..
        } => (storage_key.clone(), upload_id.clone()),
        other => panic!("expected multipart target, got {:?}", other),
    }
}

#[tokio::test]
async fn test_multipart_session_walks_parts_in_order() {
    let store = FakeObjectStore::new(true);
    let (_test_db, service) = service(&store).await;
    let total = MULTIPART_MIN_PART_SIZE + 10;

    let ticket = service
        .create_upload_session(Some(1), request("video.mp4", total))
        .await
        .unwrap();
    assert_eq!(ticket.progress.mode, "s3_multipart");
    assert_eq!(ticket.progress.next_part_number, Some(1));
    assert!(ticket.upload_url.is_none());
    let id = ticket.session.id.clone();
    let (storage_key, upload_id) = multipart_ids(&ticket.session.target);

    // Out-of-order part numbers report the real position.
    let err = service
        .create_multipart_part_upload_url(Some(1), &id, 0, 2, MULTIPART_MIN_PART_SIZE)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OffsetMismatch { expected: 0, current: 0 }));

    // Non-final parts below the minimum are refused.
    let err = service
        .create_multipart_part_upload_url(Some(1), &id, 0, 1, 1024)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let part = service
        .create_multipart_part_upload_url(Some(1), &id, 0, 1, MULTIPART_MIN_PART_SIZE)
        .await
        .unwrap();
    assert_eq!(part.part_number, 1);
    assert_eq!(part.offset, 0);
    assert!(part.upload_url.contains(&upload_id));
    store.upload_part(&upload_id, 1, MULTIPART_MIN_PART_SIZE);

    let err = service
        .complete_upload_session(Some(1), &id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UploadIncomplete { .. }));

    let err = service
        .create_multipart_part_upload_url(Some(1), &id, MULTIPART_MIN_PART_SIZE, 2, 11)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    service
        .create_multipart_part_upload_url(Some(1), &id, MULTIPART_MIN_PART_SIZE, 2, 10)
        .await
        .unwrap();
    store.upload_part(&upload_id, 2, 10);

    let progress = service
        .get_upload_session_progress(Some(1), &id)
        .await
        .unwrap();
    assert_eq!(progress.received_size, total);
    assert_eq!(progress.next_part_number, Some(3));

    let attachment = service.complete_upload_session(Some(1), &id).await.unwrap();
    assert_eq!(attachment.storage_type, StorageType::S3);
    assert_eq!(attachment.storage_key, storage_key);
    assert_eq!(attachment.size, total);
    assert_eq!(attachment.content_hash.len(), 64);
    assert_eq!(store.completed.lock().unwrap().as_slice(), [upload_id]);
    assert!(store.has_object(&storage_key));
}

#[tokio::test]
async fn test_local_chunks_rejected_for_multipart_sessions() {
    let store = FakeObjectStore::new(true);
    let (_test_db, service) = service(&store).await;
    let ticket = service
        .create_upload_session(Some(1), request("a.bin", 10))
        .await
        .unwrap();
    let err = service
        .append_upload_chunk(Some(1), &ticket.session.id, 0, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_cancel_multipart_aborts_upload() {
    let store = FakeObjectStore::new(true);
    let (_test_db, service) = service(&store).await;
    let ticket = service
        .create_upload_session(Some(1), request("a.bin", 10))
        .await
        .unwrap();
    let (_, upload_id) = multipart_ids(&ticket.session.target);

    service
        .cancel_upload_session(Some(1), &ticket.session.id)
        .await
        .unwrap();
    assert_eq!(store.aborted.lock().unwrap().as_slice(), [upload_id]);
}

#[tokio::test]
async fn test_presigned_put_when_multipart_unsupported() {
    let store = FakeObjectStore::new(false);
    let (_test_db, service) = service(&store).await;

    let ticket = service
        .create_upload_session(Some(1), request("doc.pdf", 4))
        .await
        .unwrap();
    assert_eq!(ticket.progress.mode, "s3_direct");
    let upload_url = ticket.upload_url.clone().expect("presigned PUT url");
    let storage_key = match &ticket.session.target {
        UploadTarget::S3Direct { storage_key } => storage_key.clone(),
        other => panic!("expected direct target, got {:?}", other),
    };
    assert!(upload_url.contains(&storage_key));
    let id = ticket.session.id.clone();

    let err = service
        .complete_upload_session(Some(1), &id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UploadIncomplete { received: 0, size: 4 }));

    store.put_object(&storage_key, b"%PDF");
    let attachment = service.complete_upload_session(Some(1), &id).await.unwrap();
    assert_eq!(attachment.storage_key, storage_key);

    match service
        .open_attachment(Some(1), &attachment.uid, None, false, true)
        .await
        .unwrap()
    {
        AttachmentContent::Redirect(url) => assert!(url.ends_with("?get")),
        AttachmentContent::Stream { .. } => panic!("expected redirect"),
    }

    match service
        .open_attachment(Some(1), &attachment.uid, None, false, false)
        .await
        .unwrap()
    {
        AttachmentContent::Stream { mut reader, total_size, .. } => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"%PDF");
            assert_eq!(total_size, 4);
        }
        AttachmentContent::Redirect(_) => panic!("expected stream"),
    }
}

#[tokio::test]
async fn test_cancel_direct_session_removes_uploaded_object() {
    let store = FakeObjectStore::new(false);
    let (_test_db, service) = service(&store).await;
    let ticket = service
        .create_upload_session(Some(1), request("doc.pdf", 4))
        .await
        .unwrap();
    let storage_key = match &ticket.session.target {
        UploadTarget::S3Direct { storage_key } => storage_key.clone(),
        other => panic!("expected direct target, got {:?}", other),
    };
    store.put_object(&storage_key, b"%PDF");

    service
        .cancel_upload_session(Some(1), &ticket.session.id)
        .await
        .unwrap();
    assert!(!store.has_object(&storage_key));
}
