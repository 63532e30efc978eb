//! Integration tests for inline attachments and resumable local uploads.

use std::io::Cursor;
use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncReadExt;

use memos_api::services::{
    AttachmentContent, AttachmentService, ByteRange, StorageResolver, UploadJanitor,
};
use memos_core::{
    CreateAttachment, CreateUploadSession, Error, StorageSetting, Visibility,
};
use memos_db::test_fixtures::{TestDataBuilder, TestDatabase};
use memos_db::{LocalBackend, StorageBackend};

struct Fixture {
    test_db: TestDatabase,
    service: AttachmentService,
    local: LocalBackend,
}

async fn fixture() -> Fixture {
    let test_db = TestDatabase::new().await;
    let assets = test_db.subdir("assets");
    let service = AttachmentService::new(
        test_db.db.clone(),
        StorageResolver::from_settings(&assets),
        test_db.subdir("uploads"),
    );
    Fixture {
        local: LocalBackend::new(assets),
        test_db,
        service,
    }
}

fn inline(filename: &str, data: &[u8]) -> CreateAttachment {
    CreateAttachment {
        filename: filename.to_string(),
        content_type: None,
        content: BASE64_STANDARD.encode(data),
        memo_name: None,
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

async fn read_all(content: AttachmentContent) -> (Vec<u8>, Option<(u64, u64)>) {
    match content {
        AttachmentContent::Stream { mut reader, range, .. } => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            (buf, range)
        }
        AttachmentContent::Redirect(url) => panic!("unexpected redirect to {}", url),
    }
}

// =============================================================================
// INLINE
// =============================================================================

#[tokio::test]
async fn test_inline_attachment_requires_viewer_and_valid_base64() {
    let fx = fixture().await;

    let err = fx
        .service
        .create_attachment(None, inline("a.txt", b"hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));

    let mut bad = inline("a.txt", b"hi");
    bad.content = "%%% not base64".into();
    let err = fx.service.create_attachment(Some(1), bad).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = fx
        .service
        .create_attachment(Some(1), inline("../a.txt", b"hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_inline_attachment_respects_size_limit() {
    let fx = fixture().await;
    fx.test_db
        .db
        .settings
        .set_storage_setting(&StorageSetting {
            upload_size_limit_mb: 1,
            ..StorageSetting::default()
        })
        .await
        .unwrap();

    let big = vec![7u8; 1024 * 1024 + 1];
    let err = fx
        .service
        .create_attachment(Some(1), inline("big.bin", &big))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_identical_content_is_stored_once_and_refcounted() {
    let fx = fixture().await;

    let a = fx
        .service
        .create_attachment(Some(1), inline("a.txt", b"same bytes"))
        .await
        .unwrap();
    let b = fx
        .service
        .create_attachment(Some(1), inline("b.txt", b"same bytes"))
        .await
        .unwrap();
    assert_ne!(a.uid, b.uid);
    assert_eq!(a.storage_key, b.storage_key);
    assert_eq!(a.content_type, "application/octet-stream");

    // Other users never share objects.
    let c = fx
        .service
        .create_attachment(Some(2), inline("c.txt", b"same bytes"))
        .await
        .unwrap();
    assert_ne!(c.storage_key, a.storage_key);

    fx.service.delete_attachment(Some(1), &a.uid).await.unwrap();
    assert!(fx.local.exists(&b.storage_key).await.unwrap());

    fx.service.delete_attachment(Some(1), &b.uid).await.unwrap();
    assert!(!fx.local.exists(&b.storage_key).await.unwrap());
    assert!(fx.local.exists(&c.storage_key).await.unwrap());
}

#[tokio::test]
async fn test_missing_object_is_not_reused() {
    let fx = fixture().await;
    let stale = fx
        .service
        .create_attachment(Some(1), inline("a.txt", b"vanishing"))
        .await
        .unwrap();
    fx.local.delete(&stale.storage_key).await.unwrap();

    assert!(matches!(
        fx.service
            .open_attachment(Some(1), &stale.uid, None, false, false)
            .await,
        Err(Error::NotFound(_))
    ));

    let fresh = fx
        .service
        .create_attachment(Some(1), inline("b.txt", b"vanishing"))
        .await
        .unwrap();
    assert_ne!(fresh.storage_key, stale.storage_key);
    let content = fx
        .service
        .open_attachment(Some(1), &fresh.uid, None, false, false)
        .await
        .unwrap();
    assert_eq!(read_all(content).await.0, b"vanishing".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_delete_and_reuse_keep_object() {
    let fx = fixture().await;

    for i in 0..10 {
        let payload = format!("shared payload {}", i);
        let original = fx
            .service
            .create_attachment(Some(1), inline("a.txt", payload.as_bytes()))
            .await
            .unwrap();

        let deleter = {
            let service = fx.service.clone();
            let uid = original.uid.clone();
            tokio::spawn(async move { service.delete_attachment(Some(1), &uid).await })
        };
        let creator = {
            let service = fx.service.clone();
            let req = inline("b.txt", payload.as_bytes());
            tokio::spawn(async move { service.create_attachment(Some(1), req).await })
        };
        deleter.await.unwrap().unwrap();
        let copy = creator.await.unwrap().unwrap();

        assert!(fx.local.exists(&copy.storage_key).await.unwrap(), "iteration {}", i);
        let content = fx
            .service
            .open_attachment(Some(1), &copy.uid, None, false, false)
            .await
            .unwrap();
        assert_eq!(read_all(content).await.0, payload.into_bytes());
    }
}

#[tokio::test]
async fn test_delete_attachment_of_other_user_is_not_found() {
    let fx = fixture().await;
    let a = fx
        .service
        .create_attachment(Some(1), inline("a.txt", b"x"))
        .await
        .unwrap();
    let err = fx.service.delete_attachment(Some(2), &a.uid).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_attachment_visible_through_linked_memo() {
    let fx = fixture().await;
    let builder = TestDataBuilder::new(&fx.test_db.db);
    let public = builder
        .memo(1, "public")
        .visibility(Visibility::Public)
        .insert()
        .await;
    let private = builder.memo(1, "private").insert().await;

    let mut req = inline("a.txt", b"linked");
    req.memo_name = Some(public.name());
    let linked = fx.service.create_attachment(Some(1), req).await.unwrap();
    assert_eq!(linked.memo_id, Some(public.id));

    let mut req = inline("b.txt", b"hidden");
    req.memo_name = Some(private.name());
    let hidden = fx.service.create_attachment(Some(1), req).await.unwrap();

    assert!(fx.service.get_attachment(Some(2), &linked.uid).await.is_ok());
    assert!(fx.service.get_attachment(None, &linked.uid).await.is_ok());
    assert!(matches!(
        fx.service.get_attachment(Some(2), &hidden.uid).await,
        Err(Error::NotFound(_))
    ));

    // Linking to a memo the creator cannot edit is refused.
    let theirs = builder.memo(2, "theirs").insert().await;
    let mut req = inline("c.txt", b"nope");
    req.memo_name = Some(theirs.name());
    assert!(matches!(
        fx.service.create_attachment(Some(1), req).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_ranged_reads() {
    let fx = fixture().await;
    let a = fx
        .service
        .create_attachment(Some(1), inline("a.txt", b"0123456789"))
        .await
        .unwrap();

    let content = fx
        .service
        .open_attachment(Some(1), &a.uid, Some(ByteRange::parse("bytes=2-4").unwrap()), false, false)
        .await
        .unwrap();
    assert_eq!(read_all(content).await, (b"234".to_vec(), Some((2, 4))));

    let content = fx
        .service
        .open_attachment(Some(1), &a.uid, Some(ByteRange::Suffix(3)), false, false)
        .await
        .unwrap();
    assert_eq!(read_all(content).await, (b"789".to_vec(), Some((7, 9))));

    // Local storage ignores the redirect hint.
    let content = fx
        .service
        .open_attachment(Some(1), &a.uid, None, false, true)
        .await
        .unwrap();
    assert_eq!(read_all(content).await, (b"0123456789".to_vec(), None));

    let err = fx
        .service
        .open_attachment(Some(1), &a.uid, Some(ByteRange::parse("bytes=10-").unwrap()), false, false)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidInput(_)));
}

// =============================================================================
// THUMBNAILS
// =============================================================================

#[tokio::test]
async fn test_image_attachment_gets_shared_thumbnail() {
    let fx = fixture().await;
    let image = png(1200, 600);

    let first = fx
        .service
        .create_attachment(Some(1), inline("photo.png", &image))
        .await
        .unwrap();
    assert_eq!(first.content_type, "image/png");
    let thumb = first.thumbnail.clone().expect("thumbnail");
    assert_eq!(thumb.content_type, "image/jpeg");
    assert!(fx.local.exists(&thumb.storage_key).await.unwrap());

    let decoded = image::load_from_memory(&std::fs::read(
        fx.test_db.dir().join("assets").join(&thumb.storage_key),
    )
    .unwrap())
    .unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 320));

    let second = fx
        .service
        .create_attachment(Some(1), inline("copy.png", &image))
        .await
        .unwrap();
    assert_eq!(second.thumbnail.map(|t| t.storage_key), Some(thumb.storage_key.clone()));

    let content = fx
        .service
        .open_attachment(Some(1), &first.uid, None, true, false)
        .await
        .unwrap();
    let (bytes, _) = read_all(content).await;
    assert_eq!(bytes.len() as i64, thumb.size);

    fx.service.delete_attachment(Some(1), &first.uid).await.unwrap();
    fx.service.delete_attachment(Some(1), &second.uid).await.unwrap();
    assert!(!fx.local.exists(&thumb.storage_key).await.unwrap());
}

#[tokio::test]
async fn test_undecodable_image_still_creates_attachment() {
    let fx = fixture().await;
    let attachment = fx
        .service
        .create_attachment(Some(1), inline("broken.png", b"not really a png"))
        .await
        .unwrap();
    assert!(attachment.thumbnail.is_none());
}

// =============================================================================
// RESUMABLE LOCAL UPLOADS
// =============================================================================

fn session_request(filename: &str, size: i64) -> CreateUploadSession {
    CreateUploadSession {
        filename: filename.to_string(),
        content_type: Some("text/plain".into()),
        size,
        memo_name: None,
    }
}

#[tokio::test]
async fn test_local_upload_appends_and_completes() {
    let fx = fixture().await;
    let ticket = fx
        .service
        .create_upload_session(Some(1), session_request("notes.txt", 10))
        .await
        .unwrap();
    assert_eq!(ticket.progress.mode, "local");
    assert_eq!(ticket.progress.received_size, 0);
    assert!(ticket.upload_url.is_none());
    let id = ticket.session.id.clone();

    let progress = fx
        .service
        .append_upload_chunk(Some(1), &id, 0, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    assert_eq!(progress.received_size, 5);

    let err = fx
        .service
        .append_upload_chunk(Some(1), &id, 0, Bytes::from_static(b"hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OffsetMismatch { expected: 0, current: 5 }));

    let err = fx
        .service
        .complete_upload_session(Some(1), &id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UploadIncomplete { received: 5, size: 10 }));

    let err = fx
        .service
        .append_upload_chunk(Some(1), &id, 5, Bytes::from_static(b"world!"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    fx.service
        .append_upload_chunk(Some(1), &id, 5, Bytes::from_static(b"world"))
        .await
        .unwrap();
    let progress = fx
        .service
        .get_upload_session_progress(Some(1), &id)
        .await
        .unwrap();
    assert_eq!(progress.received_size, 10);

    let attachment = fx.service.complete_upload_session(Some(1), &id).await.unwrap();
    assert_eq!(attachment.size, 10);
    assert_eq!(attachment.filename, "notes.txt");
    assert_eq!(
        attachment.content_hash,
        memos_db::compute_content_hash(b"helloworld")
    );

    let content = fx
        .service
        .open_attachment(Some(1), &attachment.uid, None, false, false)
        .await
        .unwrap();
    assert_eq!(read_all(content).await.0, b"helloworld".to_vec());

    assert!(!fx.service.scratch_dir().join(format!("{}.part", id)).exists());
    assert!(matches!(
        fx.service.get_upload_session_progress(Some(1), &id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_at_same_offset_keep_one_chunk() {
    let fx = fixture().await;

    for i in 0..10 {
        let ticket = fx
            .service
            .create_upload_session(Some(1), session_request("race.txt", 10))
            .await
            .unwrap();
        let id = ticket.session.id.clone();

        let append = |data: &'static [u8]| {
            let service = fx.service.clone();
            let id = id.clone();
            tokio::spawn(async move {
                service
                    .append_upload_chunk(Some(1), &id, 0, Bytes::from_static(data))
                    .await
            })
        };
        let long = append(b"AAAAAAAAAA");
        let short = append(b"BBBB");
        let (long, short) = (long.await.unwrap(), short.await.unwrap());
        assert!(long.is_ok() != short.is_ok(), "iteration {}", i);

        let expected: &[u8] = if long.is_ok() {
            assert!(matches!(short, Err(Error::OffsetMismatch { current: 10, .. })));
            b"AAAAAAAAAA"
        } else {
            assert!(matches!(long, Err(Error::OffsetMismatch { current: 4, .. })));
            fx.service
                .append_upload_chunk(Some(1), &id, 4, Bytes::from_static(b"CCCCCC"))
                .await
                .unwrap();
            b"BBBBCCCCCC"
        };

        let attachment = fx.service.complete_upload_session(Some(1), &id).await.unwrap();
        assert_eq!(attachment.content_hash, memos_db::compute_content_hash(expected));
        let content = fx
            .service
            .open_attachment(Some(1), &attachment.uid, None, false, false)
            .await
            .unwrap();
        assert_eq!(read_all(content).await.0, expected.to_vec(), "iteration {}", i);
    }
}

#[tokio::test]
async fn test_local_upload_reuses_existing_content() {
    let fx = fixture().await;
    let existing = fx
        .service
        .create_attachment(Some(1), inline("a.txt", b"abc"))
        .await
        .unwrap();

    let ticket = fx
        .service
        .create_upload_session(Some(1), session_request("b.txt", 3))
        .await
        .unwrap();
    fx.service
        .append_upload_chunk(Some(1), &ticket.session.id, 0, Bytes::from_static(b"abc"))
        .await
        .unwrap();
    let attachment = fx
        .service
        .complete_upload_session(Some(1), &ticket.session.id)
        .await
        .unwrap();
    assert_eq!(attachment.storage_key, existing.storage_key);
}

#[tokio::test]
async fn test_upload_session_validation_and_ownership() {
    let fx = fixture().await;

    let err = fx
        .service
        .create_upload_session(Some(1), session_request("a.txt", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = fx
        .service
        .create_upload_session(None, session_request("a.txt", 3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));

    let ticket = fx
        .service
        .create_upload_session(Some(1), session_request("a.txt", 3))
        .await
        .unwrap();
    let err = fx
        .service
        .append_upload_chunk(Some(2), &ticket.session.id, 0, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = fx
        .service
        .create_multipart_part_upload_url(Some(1), &ticket.session.id, 0, 1, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_cancel_removes_scratch_files() {
    let fx = fixture().await;
    let ticket = fx
        .service
        .create_upload_session(Some(1), session_request("a.txt", 4))
        .await
        .unwrap();
    let id = ticket.session.id.clone();
    fx.service
        .upload_session_thumbnail(Some(1), &id, Bytes::from(png(8, 8)))
        .await
        .unwrap();

    let part = fx.service.scratch_dir().join(format!("{}.part", id));
    let thumb = fx.service.scratch_dir().join(format!("{}.thumb", id));
    assert!(part.exists());
    assert!(thumb.exists());

    fx.service.cancel_upload_session(Some(1), &id).await.unwrap();
    assert!(!part.exists());
    assert!(!thumb.exists());
    assert!(matches!(
        fx.service.cancel_upload_session(Some(1), &id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_uploaded_thumbnail_used_on_completion() {
    let fx = fixture().await;
    let ticket = fx
        .service
        .create_upload_session(
            Some(1),
            CreateUploadSession {
                filename: "raw.png".into(),
                content_type: None,
                size: 4,
                memo_name: None,
            },
        )
        .await
        .unwrap();
    let id = ticket.session.id.clone();
    fx.service
        .upload_session_thumbnail(Some(1), &id, Bytes::from(png(16, 16)))
        .await
        .unwrap();
    fx.service
        .append_upload_chunk(Some(1), &id, 0, Bytes::from_static(b"\x00\x01\x02\x03"))
        .await
        .unwrap();

    let attachment = fx.service.complete_upload_session(Some(1), &id).await.unwrap();
    assert!(attachment.thumbnail.is_some());
    assert!(!fx.service.scratch_dir().join(format!("{}.thumb", id)).exists());
}

#[tokio::test]
async fn test_expired_sessions_are_swept() {
    let fx = fixture().await;
    let stale = fx
        .service
        .create_upload_session(Some(1), session_request("old.txt", 4))
        .await
        .unwrap();
    let fresh = fx
        .service
        .create_upload_session(Some(1), session_request("new.txt", 4))
        .await
        .unwrap();
    fx.test_db
        .db
        .upload_sessions
        .set_updated_time(&stale.session.id, Utc::now() - chrono::Duration::days(2))
        .await
        .unwrap();

    let janitor = UploadJanitor::new(fx.service.clone(), Duration::from_secs(3600));
    assert_eq!(janitor.sweep().await, 1);

    assert!(!fx
        .service
        .scratch_dir()
        .join(format!("{}.part", stale.session.id))
        .exists());
    assert!(fx
        .service
        .get_upload_session_progress(Some(1), &fresh.session.id)
        .await
        .is_ok());
    assert_eq!(
        fx.service
            .cleanup_expired_upload_sessions(Utc::now())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_janitor_stops_on_shutdown() {
    let fx = fixture().await;
    let handle = UploadJanitor::new(fx.service.clone(), Duration::from_millis(10)).start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.shutdown().await.unwrap();
}
