//! Object storage abstraction with a local filesystem backend.
//!
//! This module provides:
//! - [`StorageBackend`]: put / stream / open / ranged open / delete over a
//!   flat key space
//! - [`DirectUpload`]: presigned and multipart extensions implemented only by
//!   object stores that clients can upload to directly
//! - [`LocalBackend`]: rooted directory with atomic writes
//! - SHA-256 content hashing used for attachment deduplication
//!
//! ## Example
//!
//! ```rust,ignore
//! use memos_db::file_storage::{LocalBackend, StorageBackend};
//!
//! let backend = LocalBackend::new("/var/lib/memos/assets");
//! backend.validate().await?;
//! backend.put("attachments/abc.png", "image/png", bytes).await?;
//! let reader = backend.open_range("attachments/abc.png", 0, Some(1023)).await?;
//! ```

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use memos_core::{Error, Result, StorageType, UploadedPart};

/// Readable object stream returned by [`StorageBackend::open`].
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Storage backend trait for the attachment object store.
///
/// Keys are relative, slash-separated paths.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `data` at `key`, replacing any existing object. Returns bytes written.
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<u64>;

    /// Store exactly `declared_size` bytes read from `reader` at `key`.
    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        reader: BoxedReader,
        declared_size: u64,
    ) -> Result<u64>;

    /// Open the whole object.
    async fn open(&self, key: &str) -> Result<BoxedReader>;

    /// Open bytes `start..=end`; `None` reads to the end of the object.
    async fn open_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<BoxedReader>;

    /// Delete the object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    fn storage_type(&self) -> StorageType;

    /// Presigned/multipart extensions, when the backend supports them.
    fn direct_upload(&self) -> Option<&dyn DirectUpload> {
        None
    }
}

/// Client-direct upload operations of an S3-compatible store.
///
/// Backends that cannot perform multipart uploads return
/// [`Error::Unsupported`] from [`DirectUpload::create_multipart_upload`].
#[async_trait]
pub trait DirectUpload: Send + Sync {
    /// Size of the stored object.
    async fn head_size(&self, key: &str) -> Result<i64>;

    async fn presign_put_object_url(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String>;

    async fn presign_get_object_url(&self, key: &str, expires_in: Duration) -> Result<String>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String>;

    async fn presign_upload_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Result<String>;

    /// Parts uploaded so far, in ascending part number order.
    async fn list_multipart_uploaded_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Filesystem storage backend.
///
/// Objects live at `{root}/{key}`.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new filesystem backend with the given base directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, rejecting absolute and escaping keys.
    async fn open_file(&self, key: &str) -> Result<fs::File> {
        match fs::File::open(self.full_path(key)?).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('\\') {
            return Err(Error::InvalidInput(format!("invalid storage key: {:?}", key)));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid storage key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }

    /// Validate that the storage backend can write, read, and delete files.
    ///
    /// Performs a full round-trip test at startup to catch filesystem issues
    /// (permission errors, read-only mounts, missing directories) early.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let test_dir = self.root.join(".health-check");
        let test_file = test_dir.join("test.bin");

        fs::create_dir_all(&test_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", test_dir, e))?;

        let data = b"storage-health-check";
        fs::write(&test_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", test_file, e))?;

        let read_data = fs::read(&test_file)
            .await
            .map_err(|e| format!("read({:?}): {}", test_file, e))?;
        if read_data != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&test_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", test_file, e))?;
        let _ = fs::remove_dir(&test_dir).await; // Best-effort cleanup

        Ok(())
    }

    /// Create the parent directory and return a unique sibling temp path.
    async fn prepare(&self, full_path: &Path) -> Result<PathBuf> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "file_storage: create_dir_all failed");
                e
            })?;
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(full_path.with_file_name(format!(".{}.{}.tmp", file_name, suffix)))
    }

    /// Rename the temp file into place and set 0644.
    async fn commit(&self, temp_path: &Path, full_path: &Path) -> Result<()> {
        fs::rename(temp_path, full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_storage: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn put(&self, key: &str, _content_type: &str, data: Bytes) -> Result<u64> {
        let full_path = self.full_path(key)?;
        debug!(storage_key = %key, full_path = %full_path.display(), size_bytes = data.len(), "file_storage: put");

        let temp_path = self.prepare(&full_path).await?;
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            Ok::<_, Error>(())
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        self.commit(&temp_path, &full_path).await?;
        Ok(data.len() as u64)
    }

    async fn put_stream(
        &self,
        key: &str,
        _content_type: &str,
        reader: BoxedReader,
        declared_size: u64,
    ) -> Result<u64> {
        let full_path = self.full_path(key)?;
        debug!(storage_key = %key, size_bytes = declared_size, "file_storage: put_stream");

        let temp_path = self.prepare(&full_path).await?;
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            // One extra byte detects bodies longer than declared.
            let mut limited = reader.take(declared_size + 1);
            let written = tokio::io::copy(&mut limited, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, Error>(written)
        };
        let written = match write.await {
            Ok(n) if n == declared_size => n,
            Ok(n) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(Error::Storage(format!(
                    "stream size mismatch for {}: declared {}, read {}",
                    key, declared_size, n
                )));
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        self.commit(&temp_path, &full_path).await?;
        Ok(written)
    }

    async fn open(&self, key: &str) -> Result<BoxedReader> {
        let file = self.open_file(key).await?;
        Ok(Box::pin(file))
    }

    async fn open_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<BoxedReader> {
        if let Some(end) = end {
            if end < start {
                return Err(Error::InvalidInput(format!(
                    "invalid range {}-{}",
                    start, end
                )));
            }
        }
        let mut file = self.open_file(key).await?;
        file.seek(SeekFrom::Start(start)).await?;
        match end {
            Some(end) => Ok(Box::pin(file.take(end - start + 1))),
            None => Ok(Box::pin(file)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)?).await?)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 content hasher.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }

    /// Hash a file without loading it into memory. Returns `(hash, size)`.
    pub async fn hash_file(path: impl AsRef<Path>) -> Result<(String, u64)> {
        let mut file = fs::File::open(path.as_ref()).await?;
        let mut hasher = Self::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let len = hasher.len();
        Ok((hasher.finalize(), len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut reader: BoxedReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            compute_content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_streaming_hasher_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.len(), 5);
        assert_eq!(hasher.finalize(), compute_content_hash(b"hello"));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let backend = LocalBackend::new("/tmp/memos-test-root");
        assert!(backend.full_path("../etc/passwd").is_err());
        assert!(backend.full_path("/etc/passwd").is_err());
        assert!(backend.full_path("").is_err());
        assert!(backend.full_path("attachments/ab/cd.png").is_ok());
    }

    #[tokio::test]
    async fn test_put_open_range_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.validate().await.unwrap();

        let written = backend
            .put("a/b.txt", "text/plain", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert!(backend.exists("a/b.txt").await.unwrap());

        assert_eq!(read_all(backend.open("a/b.txt").await.unwrap()).await, b"0123456789");
        assert_eq!(
            read_all(backend.open_range("a/b.txt", 2, Some(4)).await.unwrap()).await,
            b"234"
        );
        assert_eq!(
            read_all(backend.open_range("a/b.txt", 7, None).await.unwrap()).await,
            b"789"
        );
        assert!(backend.open_range("a/b.txt", 5, Some(4)).await.is_err());

        backend.delete("a/b.txt").await.unwrap();
        assert!(!backend.exists("a/b.txt").await.unwrap());
        // Idempotent
        backend.delete("a/b.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(matches!(backend.open("a/gone.txt").await, Err(Error::NotFound(_))));
        assert!(matches!(
            backend.open_range("a/gone.txt", 0, Some(3)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_stream_enforces_declared_size() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());

        let reader: BoxedReader = Box::pin(std::io::Cursor::new(b"abcdef".to_vec()));
        assert_eq!(backend.put_stream("s.bin", "", reader, 6).await.unwrap(), 6);

        let reader: BoxedReader = Box::pin(std::io::Cursor::new(b"abcdef".to_vec()));
        assert!(backend.put_stream("t.bin", "", reader, 4).await.is_err());
        assert!(!backend.exists("t.bin").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_put_sets_0644() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend
            .put("p.bin", "", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("p.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let (hash, size) = ContentHasher::hash_file(&path).await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(hash, compute_content_hash(b"hello"));
    }
}
