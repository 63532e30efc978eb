//! S3-compatible storage backend.
//!
//! Built from the workspace storage setting with static credentials. Large
//! streamed bodies are uploaded through a server-side multipart upload; the
//! [`DirectUpload`] half hands presigned URLs to clients instead.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use memos_core::defaults::MULTIPART_PART_SIZE;
use memos_core::{Error, Result, S3Config, StorageType, UploadedPart};

use crate::file_storage::{BoxedReader, DirectUpload, StorageBackend};

fn storage_error<E: std::error::Error>(op: &str, key: &str, err: E) -> Error {
    Error::Storage(format!("s3 {} {}: {}", op, key, DisplayErrorContext(err)))
}

fn presigning(expires_in: Duration) -> Result<PresigningConfig> {
    PresigningConfig::expires_in(expires_in)
        .map_err(|e| Error::Config(format!("invalid presign expiry: {}", e)))
}

/// Whether an S3 error means the service lacks multipart support.
fn is_not_implemented<E: ProvideErrorMetadata, R>(
    err: &SdkError<E, R>,
    status: Option<u16>,
) -> bool {
    err.code() == Some("NotImplemented") || status == Some(501)
}

/// Object store client bound to one bucket.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build a client from the workspace S3 settings.
    pub fn new(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Config("s3 bucket is required".into()));
        }
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.access_key_secret.clone(),
            None,
            None,
            "memos-workspace-setting",
        );
        let region = if config.region.is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.clone()
        };
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(config.use_path_style);
        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(config.endpoint.clone());
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, content_type: &str, data: Bytes) -> Result<u64> {
        let len = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(len as i64)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("put_object", key, e))?;
        Ok(len)
    }

    /// Upload `reader` in fixed-size parts. The upload is aborted on failure.
    async fn put_multipart(
        &self,
        key: &str,
        content_type: &str,
        mut reader: BoxedReader,
        first: Vec<u8>,
        declared_size: u64,
    ) -> Result<u64> {
        let upload_id = self.create_multipart_upload(key, content_type).await?;
        let part_size = MULTIPART_PART_SIZE as usize;

        let upload = async {
            let mut completed = Vec::new();
            let mut total = 0u64;
            let mut part_number = 1;
            let mut chunk = first;
            loop {
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len() as u64;
                let output = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(|e| storage_error("upload_part", key, e))?;
                completed.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .build(),
                );
                part_number += 1;
                chunk = read_chunk(&mut reader, part_size).await?;
            }
            if total != declared_size {
                return Err(Error::Storage(format!(
                    "stream size mismatch for {}: declared {}, read {}",
                    key, declared_size, total
                )));
            }
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| storage_error("complete_multipart_upload", key, e))?;
            Ok(total)
        };

        match upload.await {
            Ok(total) => Ok(total),
            Err(e) => {
                if let Err(abort_err) = self.abort_multipart_upload(key, &upload_id).await {
                    warn!(storage_key = %key, error = %abort_err, "s3: abort after failed upload failed");
                }
                Err(e)
            }
        }
    }
}

/// Read up to `limit` bytes, stopping early only at end of stream.
async fn read_chunk(reader: &mut BoxedReader, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit.min(1024 * 1024));
    reader.take(limit as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<u64> {
        debug!(storage_key = %key, size_bytes = data.len(), "s3: put");
        self.put_object(key, content_type, data).await
    }

    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        mut reader: BoxedReader,
        declared_size: u64,
    ) -> Result<u64> {
        debug!(storage_key = %key, size_bytes = declared_size, "s3: put_stream");
        let part_size = MULTIPART_PART_SIZE as usize;
        let first = read_chunk(&mut reader, part_size).await?;
        if first.len() < part_size {
            if first.len() as u64 != declared_size {
                return Err(Error::Storage(format!(
                    "stream size mismatch for {}: declared {}, read {}",
                    key,
                    declared_size,
                    first.len()
                )));
            }
            return self.put_object(key, content_type, Bytes::from(first)).await;
        }
        self.put_multipart(key, content_type, reader, first, declared_size)
            .await
    }

    async fn open(&self, key: &str) -> Result<BoxedReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("get_object", key, e))?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn open_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<BoxedReader> {
        let range = match end {
            Some(end) if end < start => {
                return Err(Error::InvalidInput(format!("invalid range {}-{}", start, end)))
            }
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| storage_error("get_object", key, e))?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("delete_object", key, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(storage_error("head_object", key, e)),
        }
    }

    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    fn direct_upload(&self) -> Option<&dyn DirectUpload> {
        Some(self)
    }
}

#[async_trait]
impl DirectUpload for S3Backend {
    async fn head_size(&self, key: &str) -> Result<i64> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Error::NotFound(format!("object {}", key))
                } else {
                    storage_error("head_object", key, e)
                }
            })?;
        Ok(output.content_length().unwrap_or(0))
    }

    async fn presign_put_object_url(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning(expires_in)?)
            .await
            .map_err(|e| storage_error("presign_put_object", key, e))?;
        Ok(request.uri().to_string())
    }

    async fn presign_get_object_url(&self, key: &str, expires_in: Duration) -> Result<String> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning(expires_in)?)
            .await
            .map_err(|e| storage_error("presign_get_object", key, e))?;
        Ok(request.uri().to_string())
    }

    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                let status = e.raw_response().map(|r| r.status().as_u16());
                if is_not_implemented(&e, status) {
                    Error::Unsupported(format!("multipart upload not supported for {}", key))
                } else {
                    storage_error("create_multipart_upload", key, e)
                }
            })?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Storage(format!("s3 returned no upload id for {}", key)))
    }

    async fn presign_upload_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Result<String> {
        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning(expires_in)?)
            .await
            .map_err(|e| storage_error("presign_upload_part", key, e))?;
        Ok(request.uri().to_string())
    }

    async fn list_multipart_uploaded_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| storage_error("list_parts", key, e))?;

            for part in output.parts() {
                if let Some(part_number) = part.part_number() {
                    parts.push(UploadedPart {
                        part_number,
                        size: part.size().unwrap_or(0),
                        etag: part.e_tag().unwrap_or_default().to_string(),
                    });
                }
            }

            match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let completed = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_error("complete_multipart_upload", key, e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| storage_error("abort_multipart_upload", key, e))?;
        Ok(())
    }
}
