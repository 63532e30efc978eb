//! Integration tests for attachments, upload sessions and settings.

use chrono::Duration;
use memos_core::{
    AttachmentThumbnail, NewAttachment, NewUploadSession, S3Config, StorageSetting, StorageType,
    UploadTarget,
};
use memos_db::test_fixtures::{TestDataBuilder, TestDatabase};
use memos_db::{compute_content_hash, now_micros};

fn new_attachment(uid: &str, creator_id: i64, key: &str, data: &[u8]) -> NewAttachment {
    NewAttachment {
        uid: uid.to_string(),
        creator_id,
        filename: format!("{}.txt", uid),
        content_type: "text/plain".to_string(),
        size: data.len() as i64,
        content_hash: compute_content_hash(data),
        storage_type: StorageType::Local,
        storage_key: key.to_string(),
        memo_id: None,
    }
}

fn local_session(id: &str, size: i64) -> NewUploadSession {
    NewUploadSession {
        id: id.to_string(),
        creator_id: 1,
        filename: "big.bin".to_string(),
        content_type: "application/octet-stream".to_string(),
        size,
        memo_name: None,
        target: UploadTarget::Local {
            temp_path: format!("/tmp/{}.part", id),
        },
    }
}

#[tokio::test]
async fn test_shared_storage_key_reference_count() {
    let test_db = TestDatabase::new().await;
    let repo = &test_db.db.attachments;

    let a = repo.insert(new_attachment("a", 1, "k/shared", b"same")).await.unwrap();
    let b = repo.insert(new_attachment("b", 1, "k/shared", b"same")).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(repo.count_by_storage_key(StorageType::Local, "k/shared").await.unwrap(), 2);
    assert_eq!(repo.count_by_storage_key(StorageType::S3, "k/shared").await.unwrap(), 0);

    assert!(repo.delete(a.id).await.unwrap());
    assert!(!repo.delete(a.id).await.unwrap());
    assert_eq!(repo.count_by_storage_key(StorageType::Local, "k/shared").await.unwrap(), 1);
    assert!(repo.get_by_uid("b").await.unwrap().is_some());
}

#[tokio::test]
async fn test_find_by_content_hash_is_per_creator() {
    let test_db = TestDatabase::new().await;
    let repo = &test_db.db.attachments;
    repo.insert(new_attachment("a", 1, "k/a", b"payload")).await.unwrap();

    let hash = compute_content_hash(b"payload");
    let hit = repo.find_by_content_hash(1, &hash).await.unwrap().unwrap();
    assert_eq!(hit.storage_key, "k/a");
    assert!(repo.find_by_content_hash(2, &hash).await.unwrap().is_none());
}

#[tokio::test]
async fn test_thumbnail_sidecar() {
    let test_db = TestDatabase::new().await;
    let repo = &test_db.db.attachments;
    let a = repo.insert(new_attachment("a", 1, "k/img", b"png")).await.unwrap();
    let _b = repo.insert(new_attachment("b", 1, "k/img", b"png")).await.unwrap();

    assert!(repo
        .find_shared_thumbnail(StorageType::Local, "k/img")
        .await
        .unwrap()
        .is_none());

    let thumb = AttachmentThumbnail {
        filename: "a.txt.thumb.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        size: 12,
        storage_key: "k/img.thumb.jpg".to_string(),
    };
    repo.set_thumbnail(a.id, &thumb).await.unwrap();

    let stored = repo.get_by_uid("a").await.unwrap().unwrap();
    assert_eq!(stored.thumbnail, Some(thumb.clone()));
    assert_eq!(
        repo.find_shared_thumbnail(StorageType::Local, "k/img").await.unwrap(),
        Some(thumb)
    );
    assert!(repo.storage_key_in_use("k/img.thumb.jpg").await.unwrap());
    assert!(!repo.storage_key_in_use("k/other").await.unwrap());
}

#[tokio::test]
async fn test_memo_delete_unlinks_attachments() {
    let test_db = TestDatabase::new().await;
    let memo = TestDataBuilder::new(&test_db.db).memo(1, "m").insert().await;
    let repo = &test_db.db.attachments;
    let a = repo.insert(new_attachment("a", 1, "k/a", b"x")).await.unwrap();
    repo.set_memo(a.id, Some(memo.id)).await.unwrap();
    assert_eq!(repo.list_by_memo(memo.id).await.unwrap().len(), 1);

    test_db.db.memos.delete(&memo, &[1]).await.unwrap();
    let stored = repo.get_by_uid("a").await.unwrap().unwrap();
    assert_eq!(stored.memo_id, None);
    assert_eq!(repo.list_by_creator(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_offset_compare_and_swap() {
    let test_db = TestDatabase::new().await;
    let sessions = &test_db.db.upload_sessions;
    sessions.insert(local_session("s1", 16)).await.unwrap();

    assert!(sessions.advance_offset("s1", 0, 6).await.unwrap());
    // Stale expected offset loses.
    assert!(!sessions.advance_offset("s1", 0, 4).await.unwrap());
    assert!(sessions.advance_offset("s1", 6, 16).await.unwrap());

    let session = sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.received_size, 16);
    assert!(!sessions.advance_offset("missing", 0, 1).await.unwrap());
}

#[tokio::test]
async fn test_upload_target_persists_through_temp_path_column() {
    let test_db = TestDatabase::new().await;
    let sessions = &test_db.db.upload_sessions;
    let mut req = local_session("s2", 20 * 1024 * 1024);
    req.target = UploadTarget::S3Multipart {
        storage_key: "attachments/abc".to_string(),
        upload_id: "upload-1".to_string(),
        part_size: 8 * 1024 * 1024,
    };
    let created = sessions.insert(req.clone()).await.unwrap();
    let loaded = sessions.get("s2").await.unwrap().unwrap();
    assert_eq!(loaded.target, req.target);
    assert_eq!(loaded.create_time, created.create_time);

    assert!(sessions.set_thumbnail_temp_path("s2", "/tmp/s2.thumb").await.unwrap());
    let loaded = sessions.get("s2").await.unwrap().unwrap();
    assert_eq!(loaded.thumbnail_temp_path.as_deref(), Some("/tmp/s2.thumb"));
}

#[tokio::test]
async fn test_list_expired_and_delete() {
    let test_db = TestDatabase::new().await;
    let sessions = &test_db.db.upload_sessions;
    for id in ["old1", "old2", "fresh"] {
        sessions.insert(local_session(id, 1)).await.unwrap();
    }
    let stale = now_micros() - Duration::hours(48);
    sessions.set_updated_time("old1", stale).await.unwrap();
    sessions
        .set_updated_time("old2", stale + Duration::minutes(1))
        .await
        .unwrap();

    let cutoff = now_micros() - Duration::hours(24);
    let expired = sessions.list_expired(cutoff, 200).await.unwrap();
    let ids: Vec<&str> = expired.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["old1", "old2"]);
    assert_eq!(sessions.list_expired(cutoff, 1).await.unwrap().len(), 1);

    assert!(sessions.delete("old1").await.unwrap());
    assert!(!sessions.delete("old1").await.unwrap());
    assert!(sessions.get("fresh").await.unwrap().is_some());
}

#[tokio::test]
async fn test_storage_setting_default_is_persisted() {
    let test_db = TestDatabase::new().await;
    let settings = &test_db.db.settings;

    assert!(settings.get_raw("STORAGE").await.unwrap().is_none());
    let setting = settings.get_storage_setting().await.unwrap();
    assert_eq!(setting, StorageSetting::default());
    assert!(settings.get_raw("STORAGE").await.unwrap().is_some());

    let s3 = StorageSetting {
        storage_type: StorageType::S3,
        upload_size_limit_mb: 100,
        s3_config: Some(S3Config {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "memos".into(),
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            use_path_style: true,
        }),
    };
    settings.set_storage_setting(&s3).await.unwrap();
    assert_eq!(settings.get_storage_setting().await.unwrap(), s3);
}
