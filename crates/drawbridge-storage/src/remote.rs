use crate::paths::clean_filename;
use crate::traits::{FileReader, FileStore, SavedFile, StorageError, StorageResult};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

/// MinIO and other S3-compatible endpoints ignore the region but the SDK
/// requires one.
const STATIC_REGION: &str = "us-east-1";

/// Part size for uploads. Memory per in-flight save is bounded by one part
/// regardless of object size; S3 requires at least 5 MiB for non-final
/// parts.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub use_ssl: bool,
    pub bucket: String,
    /// Object-name prefix; all objects live under `base_path/`.
    pub base_path: String,
}

/// Backoff schedule for bucket bootstrap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

/// S3-compatible object-store tier. Eventually consistent with the local
/// tier; populated by the replicator.
pub struct RemoteStore {
    client: Client,
    bucket: String,
    base_path: String,
}

impl RemoteStore {
    /// Build the client and make sure the bucket exists, creating it when
    /// missing. Bounces with exponential backoff on any init error.
    pub async fn connect(opts: RemoteOptions, retry: RetryPolicy) -> StorageResult<Self> {
        if opts.endpoint.is_empty() {
            return Err(StorageError::Config("empty object store endpoint".to_string()));
        }
        if opts.bucket.is_empty() {
            return Err(StorageError::Config("empty object store bucket".to_string()));
        }

        let scheme = if opts.use_ssl { "https" } else { "http" };
        let endpoint_url = if opts.endpoint.contains("://") {
            opts.endpoint.clone()
        } else {
            format!("{}://{}", scheme, opts.endpoint)
        };

        let credentials = Credentials::new(
            opts.access_key_id.clone(),
            opts.secret_access_key.clone(),
            None,
            None,
            "config",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(STATIC_REGION))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(config);

        let mut base_path = opts.base_path.trim_matches('/').to_string();
        if !base_path.is_empty() {
            base_path.push('/');
        }

        let store = RemoteStore {
            client,
            bucket: opts.bucket,
            base_path,
        };

        let mut interval = retry.initial_interval;
        let mut last_err = None;
        for attempt in 1..=retry.max_attempts.max(1) {
            match store.ensure_bucket().await {
                Ok(()) => return Ok(store),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        bucket = %store.bucket,
                        error = %e,
                        "object store init failed"
                    );
                    last_err = Some(e);
                }
            }
            if attempt < retry.max_attempts {
                tokio::time::sleep(interval).await;
                interval = (interval * 2).min(retry.max_interval);
            }
        }

        Err(StorageError::Config(format!(
            "object store init failed after {} attempts: {}",
            retry.max_attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if !service_err.is_not_found() {
                    return Err(StorageError::Backend(format!(
                        "check bucket exists: {}",
                        service_err
                    )));
                }
            }
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_owned_by_you()
                    || service_err.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(StorageError::Backend(format!(
                        "create bucket: {}",
                        service_err
                    )))
                }
            }
        }
    }

    fn object_name(&self, filename: &str) -> StorageResult<String> {
        Ok(format!("{}{}", self.base_path, clean_filename(filename)?))
    }

    /// Chunked upload for streams of unknown or large length: parts are
    /// drained from the reader one at a time and uploaded as they fill.
    async fn save_multipart(
        &self,
        object: &str,
        reader: &mut FileReader,
        hasher: &mut Sha256,
    ) -> StorageResult<u64> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "create multipart upload {}: {}",
                    object,
                    e.into_service_error()
                ))
            })?;
        let Some(upload_id) = upload.upload_id().map(str::to_string) else {
            return Err(StorageError::Backend(format!(
                "create multipart upload {}: missing upload id",
                object
            )));
        };

        match self.upload_parts(object, &upload_id, reader, hasher).await {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(object, error = %abort_err, "abort multipart upload failed");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        object: &str,
        upload_id: &str,
        reader: &mut FileReader,
        hasher: &mut Sha256,
    ) -> StorageResult<u64> {
        let mut written = 0u64;
        let mut parts = Vec::new();
        let mut part_number = 1i32;

        loop {
            let data = read_part(reader, hasher, PART_SIZE).await?;
            if data.is_empty() && part_number > 1 {
                break;
            }
            let last = data.len() < PART_SIZE;
            written += data.len() as u64;

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes::Bytes::from(data)))
                .send()
                .await
                .map_err(|e| {
                    StorageError::Backend(format!(
                        "upload part {} of {}: {}",
                        part_number,
                        object,
                        e.into_service_error()
                    ))
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
            if last {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "complete multipart upload {}: {}",
                    object,
                    e.into_service_error()
                ))
            })?;

        Ok(written)
    }
}

/// Drain up to `limit` bytes from the reader, feeding the hash tee as the
/// bytes pass. A short result means the reader hit EOF.
async fn read_part(
    reader: &mut FileReader,
    hasher: &mut Sha256,
    limit: usize,
) -> StorageResult<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    while data.len() < limit {
        let want = chunk.len().min(limit - data.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        data.extend_from_slice(&chunk[..n]);
    }
    Ok(data)
}

#[async_trait]
impl FileStore for RemoteStore {
    async fn save(
        &self,
        mut reader: FileReader,
        filename: &str,
        size: Option<u64>,
    ) -> StorageResult<SavedFile> {
        let object = self.object_name(filename)?;
        let mut hasher = Sha256::new();

        let written = match size {
            // A known size within one part goes out as a single put.
            Some(size) if size <= PART_SIZE as u64 => {
                let data = read_part(&mut reader, &mut hasher, PART_SIZE).await?;
                let written = data.len() as u64;
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&object)
                    .body(ByteStream::from(bytes::Bytes::from(data)))
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::Backend(format!(
                            "put object {}: {}",
                            object,
                            e.into_service_error()
                        ))
                    })?;
                written
            }
            // Unknown or larger sizes stream part by part.
            _ => self.save_multipart(&object, &mut reader, &mut hasher).await?,
        };

        tracing::debug!(bucket = %self.bucket, object, written, "object uploaded");

        Ok(SavedFile {
            written,
            hash: hex::encode(hasher.finalize()),
        })
    }

    async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
        let object = self.object_name(filename)?;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StorageError::NotFound(filename.to_string())
                } else {
                    StorageError::Backend(format!("get object {}: {}", object, service_err))
                }
            })?;

        let size = output.content_length().unwrap_or_default().max(0) as u64;
        Ok((Box::pin(output.body.into_async_read()), size))
    }

    async fn delete(&self, filename: &str) -> StorageResult<()> {
        let object = self.object_name(filename)?;

        // S3 delete succeeds for missing keys, matching the idempotent
        // contract of the local tier.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "remove object {}: {}",
                    object,
                    e.into_service_error()
                ))
            })?;

        Ok(())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> StorageResult<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let cutoff = now - max_age.as_secs() as i64;

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.base_path)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(bucket = %self.bucket, error = %e, "object listing failed");
                    break;
                }
            };

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(modified) = object.last_modified() else {
                    continue;
                };
                if modified.secs() >= cutoff {
                    continue;
                }

                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::Backend(format!(
                            "remove old object {}: {}",
                            key,
                            e.into_service_error()
                        ))
                    })?;

                tracing::debug!(bucket = %self.bucket, key, "removed aged object");
            }
        }

        Ok(())
    }
}
