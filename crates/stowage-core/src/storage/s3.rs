//! S3-compatible object storage (AWS S3 and Baidu BOS).
//!
//! Objects up to `multipart_threshold` move in one request. Larger uploads
//! use multipart transfer with `part_size` parts on a bounded worker pool;
//! each part is retried on its own, and any failure aborts the multipart
//! session so no orphaned parts stay behind. Large downloads fetch ranges
//! in parallel into a pre-sized temp file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use super::{BackendKind, ObjectMetadata, StorageBackend, StorageError, normalize_key};
use crate::cancel::CancelToken;
use crate::checksum::sha256_file_async;
use crate::config::StorageSettings;
use crate::reporter::ProgressFn;

/// Default BOS endpoint (Beijing region).
pub const BOS_DEFAULT_ENDPOINT: &str = "https://s3.bj.bcebos.com";

/// User-metadata key carrying the object's SHA-256.
const SHA256_METADATA: &str = "sha256";

/// Resolved connection and transfer parameters.
#[derive(Clone)]
pub struct ObjectStoreConfig {
    pub kind: BackendKind,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: bool,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub max_concurrency: usize,
    pub part_retries: u32,
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("kind", &self.kind)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("has_credentials", &self.access_key.is_some())
            .field("multipart_threshold", &self.multipart_threshold)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreConfig {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        let bucket = settings
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::Config(format!("{} storage needs `storage.bucket`", settings.kind)))?;

        let (region, endpoint) = match settings.kind {
            BackendKind::Bos => (
                settings.region.clone().unwrap_or_else(|| "bj".to_string()),
                Some(
                    settings
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| BOS_DEFAULT_ENDPOINT.to_string()),
                ),
            ),
            _ => (
                settings
                    .region
                    .clone()
                    .unwrap_or_else(|| "us-east-1".to_string()),
                settings.endpoint.clone(),
            ),
        };

        if settings.kind == BackendKind::Bos
            && (settings.access_key.is_none() || settings.secret_key.is_none())
        {
            return Err(StorageError::Config(
                "bos storage needs access_key and secret_key (or BOS_ACCESS_KEY / BOS_SECRET_KEY)"
                    .to_string(),
            ));
        }

        let part_size = settings.part_size.max(5 * 1024 * 1024);
        Ok(Self {
            kind: settings.kind,
            bucket,
            region,
            force_path_style: settings.force_path_style.unwrap_or(endpoint.is_some()),
            endpoint,
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
            multipart_threshold: settings.multipart_threshold.max(part_size),
            part_size,
            max_concurrency: settings
                .max_concurrency
                .unwrap_or_else(|| num_cpus::get().clamp(2, 16))
                .max(1),
            part_retries: settings.part_retries,
        })
    }
}

/// S3 API client bound to one bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    client: s3::Client,
    config: Arc<ObjectStoreConfig>,
    cancel: CancelToken,
}

impl ObjectStoreBackend {
    pub async fn new(config: ObjectStoreConfig) -> Result<Self, StorageError> {
        let region = s3::config::Region::new(config.region.clone());

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(ak), Some(sk)) => {
                let credentials = s3::config::Credentials::new(ak, sk, None, None, "stowage");
                s3::Config::builder()
                    .behavior_version_latest()
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                // Fall through to the standard AWS provider chain.
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                s3::config::Builder::from(&shared)
            }
        };
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = s3::Client::from_conf(builder.force_path_style(config.force_path_style).build());

        tracing::debug!(?config, "object store client ready");
        Ok(Self {
            client,
            config: Arc::new(config),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    async fn put_single(
        &self,
        local: &Path,
        key: &str,
        size: u64,
        sha256: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<(), StorageError> {
        if let Some(p) = progress {
            p(0, size);
        }
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(body)
            .content_type("application/octet-stream")
            .metadata(SHA256_METADATA, sha256)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        if let Some(p) = progress {
            p(size, size);
        }
        Ok(())
    }

    async fn put_multipart(
        &self,
        local: &Path,
        key: &str,
        size: u64,
        sha256: &str,
        progress: Option<ProgressFn>,
    ) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .metadata(SHA256_METADATA, sha256)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Remote {
                code: "NoUploadId".to_string(),
                message: format!("multipart session for {key} returned no upload id"),
            })?
            .to_string();

        tracing::info!(%key, size, parts = size.div_ceil(self.config.part_size), "multipart upload");
        match self.upload_parts(local, key, &upload_id, size, progress).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                let result = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| classify(e, key));
                if let Err(e) = result {
                    self.abort_multipart(key, &upload_id).await;
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                self.abort_multipart(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => tracing::info!(%key, "multipart upload aborted"),
            Err(e) => tracing::warn!(%key, "failed to abort multipart upload: {}", DisplayErrorContext(&e)),
        }
    }

    async fn upload_parts(
        &self,
        local: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size;
        let count = size.div_ceil(part_size);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let sent = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        if let Some(p) = &progress {
            p(0, size);
        }

        for index in 0..count {
            let offset = index * part_size;
            let len = part_size.min(size - offset);
            let part = PartJob {
                client: self.client.clone(),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
                local: local.to_path_buf(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                number: i32::try_from(index + 1)
                    .map_err(|_| StorageError::Config(format!("too many parts for {key}")))?,
                offset,
                len,
            };
            let semaphore = semaphore.clone();
            let sent = sent.clone();
            let progress = progress.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| StorageError::Connection("worker pool closed".to_string()))?;
                let completed = part.run().await?;
                let done = sent.fetch_add(len, Ordering::SeqCst) + len;
                if let Some(p) = progress {
                    p(done, size);
                }
                Ok::<CompletedPart, StorageError>(completed)
            }));
        }

        let mut parts = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => {
                    // Stop queued parts from starting.
                    semaphore.close();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    semaphore.close();
                    first_error.get_or_insert(StorageError::Io(std::io::Error::other(e)));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        parts.sort_by_key(|p| p.part_number());
        Ok(parts)
    }

    async fn get_single(
        &self,
        key: &str,
        part: &Path,
        size: u64,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;
        let mut body = resp.body;
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        let mut received = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::from_io(e, key))?;
            received += chunk.len() as u64;
            if let Some(p) = progress {
                p(received, size.max(received));
            }
            self.cancel.checkpoint()?;
        }
        file.sync_all()
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        Ok(received)
    }

    async fn get_ranged(
        &self,
        key: &str,
        part: &Path,
        size: u64,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError> {
        {
            let file = std::fs::File::create(part).map_err(|e| StorageError::from_io(e, key))?;
            file.set_len(size).map_err(|e| StorageError::from_io(e, key))?;
        }

        let part_size = self.config.part_size;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let received = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        for index in 0..size.div_ceil(part_size) {
            let start = index * part_size;
            let end = (start + part_size).min(size) - 1;
            let client = self.client.clone();
            let bucket = self.config.bucket.clone();
            let key = key.to_string();
            let dest = part.to_path_buf();
            let semaphore = semaphore.clone();
            let received = received.clone();
            let progress = progress.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| StorageError::Connection("worker pool closed".to_string()))?;
                cancel.checkpoint()?;
                let resp = client
                    .get_object()
                    .bucket(&bucket)
                    .key(&key)
                    .range(format!("bytes={start}-{end}"))
                    .send()
                    .await
                    .map_err(|e| classify(e, &key))?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Connection(e.to_string()))?
                    .into_bytes();
                let len = data.len() as u64;

                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&dest)
                    .await
                    .map_err(|e| StorageError::from_io(e, &key))?;
                file.seek(SeekFrom::Start(start))
                    .await
                    .map_err(|e| StorageError::from_io(e, &key))?;
                file.write_all(&data)
                    .await
                    .map_err(|e| StorageError::from_io(e, &key))?;
                file.flush().await.map_err(|e| StorageError::from_io(e, &key))?;

                let done = received.fetch_add(len, Ordering::SeqCst) + len;
                if let Some(p) = progress {
                    p(done, size);
                }
                Ok::<u64, StorageError>(len)
            }));
        }

        let mut total = 0;
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => {
                    semaphore.close();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    semaphore.close();
                    first_error.get_or_insert(StorageError::Io(std::io::Error::other(e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    async fn head(&self, key: &str) -> Result<s3::operation::head_object::HeadObjectOutput, StorageError> {
        self.client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))
    }
}

/// One part of a multipart upload, owned by its worker task.
struct PartJob {
    client: s3::Client,
    config: Arc<ObjectStoreConfig>,
    cancel: CancelToken,
    local: PathBuf,
    key: String,
    upload_id: String,
    number: i32,
    offset: u64,
    len: u64,
}

impl PartJob {
    async fn read(&self) -> Result<Bytes, StorageError> {
        let mut file = tokio::fs::File::open(&self.local)
            .await
            .map_err(|e| StorageError::from_io(e, &self.key))?;
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| StorageError::from_io(e, &self.key))?;
        let len = usize::try_from(self.len)
            .map_err(|_| StorageError::Config(format!("part size {} too large", self.len)))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StorageError::from_io(e, &self.key))?;
        Ok(Bytes::from(buf))
    }

    async fn run(self) -> Result<CompletedPart, StorageError> {
        self.cancel.checkpoint()?;
        let data = self.read().await?;
        let mut attempt = 0;

        loop {
            let result = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .part_number(self.number)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| classify(e, &self.key));

            match result {
                Ok(out) => {
                    return Ok(CompletedPart::builder()
                        .part_number(self.number)
                        .set_e_tag(out.e_tag().map(ToString::to_string))
                        .build());
                }
                Err(e) if e.is_retryable() && attempt < self.config.part_retries => {
                    attempt += 1;
                    let backoff = part_backoff(attempt);
                    tracing::warn!(
                        key = %self.key,
                        part = self.number,
                        attempt,
                        "part upload failed, retrying in {backoff:?}: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    self.cancel.checkpoint()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Delay before retry `attempt` of a part: 500ms doubling, capped at 16s.
fn part_backoff(attempt: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1u64 << attempt.min(6)))
}

/// Sort an SDK failure into the storage error taxonomy.
fn classify<E>(err: SdkError<E, HttpResponse>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = match &err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    };
    let code = err.code().map(ToString::to_string);
    let message = err
        .message()
        .map_or_else(|| DisplayErrorContext(&err).to_string(), ToString::to_string);

    match (&err, status, code.as_deref()) {
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _, _) => {
            StorageError::Connection(DisplayErrorContext(&err).to_string())
        }
        (_, Some(404), _) | (_, _, Some("NoSuchKey" | "NotFound")) => {
            StorageError::NotFound(key.to_string())
        }
        (_, Some(401 | 403), _) | (_, _, Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch")) => {
            StorageError::PermissionDenied {
                key: key.to_string(),
                message,
            }
        }
        (_, status, code) => StorageError::Remote {
            code: code
                .map(ToString::to_string)
                .or_else(|| status.map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown".to_string()),
            message,
        },
    }
}

fn temp_sibling(local: &Path) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".stowage-part");
    local.with_file_name(name)
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        self.config.kind
    }

    fn location(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), self.config.bucket),
            None => format!("s3://{}", self.config.bucket),
        }
    }

    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError> {
        let key = normalize_key(key)?;
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| StorageError::from_io(e, &key))?
            .len();
        let sha256 = sha256_file_async(local.to_path_buf())
            .await
            .map_err(|e| StorageError::from_io(e, &key))?;
        self.cancel.checkpoint()?;

        if size > self.config.multipart_threshold {
            self.put_multipart(local, &key, size, sha256.as_str(), progress)
                .await?;
        } else {
            self.put_single(local, &key, size, sha256.as_str(), progress.as_ref())
                .await?;
        }
        tracing::debug!(%key, size, "uploaded");
        Ok(size)
    }

    async fn download(
        &self,
        key: &str,
        local: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError> {
        let key = normalize_key(key)?;
        let head = self.head(&key).await?;
        let size = head
            .content_length()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, &key))?;
        }
        let part = temp_sibling(local);
        let result = if size > self.config.multipart_threshold {
            self.get_ranged(&key, &part, size, progress).await
        } else {
            self.get_single(&key, &part, size, progress.as_ref()).await
        };

        match result {
            Ok(received) => {
                tokio::fs::rename(&part, local)
                    .await
                    .map_err(|e| StorageError::from_io(e, &key))?;
                tracing::debug!(%key, received, "downloaded");
                Ok(received)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let key = normalize_key(key)?;
        match self.head(&key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = normalize_key(key)?;
        let result = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(e, &key));
        match result {
            Ok(_) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(%key, "deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_start_matches('/').replace('\\', "/");
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(e, &prefix))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key().map(ToString::to_string)),
            );
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let key = normalize_key(key)?;
        let head = self.head(&key).await?;
        Ok(ObjectMetadata {
            size: head
                .content_length()
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or(0),
            modified: head
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            checksum: head
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA))
                .and_then(|v| stowage_schema::Sha256Digest::new(v.as_str()).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn settings(endpoint: &str) -> StorageSettings {
        StorageSettings {
            kind: BackendKind::S3,
            bucket: Some("bucket".to_string()),
            region: Some("us-east-1".to_string()),
            endpoint: Some(endpoint.to_string()),
            access_key: Some("AKIDEXAMPLE".to_string()),
            secret_key: Some("secret".to_string()),
            ..StorageSettings::default()
        }
    }

    async fn backend(server: &Server) -> ObjectStoreBackend {
        let config = ObjectStoreConfig::from_settings(&settings(&server.url())).unwrap();
        ObjectStoreBackend::new(config).await.unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let mut s = settings("http://localhost:9000");
        s.endpoint = None;
        let config = ObjectStoreConfig::from_settings(&s).unwrap();
        assert!(!config.force_path_style);
        assert_eq!(config.part_size, 10 * 1024 * 1024);
        assert_eq!(config.multipart_threshold, 100 * 1024 * 1024);

        s.bucket = None;
        assert!(matches!(
            ObjectStoreConfig::from_settings(&s),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_bos_defaults_and_required_keys() {
        let mut s = settings("unused");
        s.kind = BackendKind::Bos;
        s.endpoint = None;
        let config = ObjectStoreConfig::from_settings(&s).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some(BOS_DEFAULT_ENDPOINT));
        assert!(config.force_path_style);

        s.secret_key = None;
        assert!(matches!(
            ObjectStoreConfig::from_settings(&s),
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_exists_maps_status_codes() {
        let mut server = Server::new_async().await;
        let found = server
            .mock("HEAD", Matcher::Regex(r"^/bucket/model/1\.0\.0/present".to_string()))
            .with_status(200)
            .create_async()
            .await;
        let missing = server
            .mock("HEAD", Matcher::Regex(r"^/bucket/model/1\.0\.0/absent".to_string()))
            .with_status(404)
            .create_async()
            .await;
        let denied = server
            .mock("HEAD", Matcher::Regex(r"^/bucket/model/1\.0\.0/secret".to_string()))
            .with_status(403)
            .create_async()
            .await;

        let store = backend(&server).await;
        assert!(store.exists("model/1.0.0/present").await.unwrap());
        assert!(!store.exists("model/1.0.0/absent").await.unwrap());
        let err = store.exists("model/1.0.0/secret").await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(!err.is_retryable());

        found.assert_async().await;
        missing.assert_async().await;
        denied.assert_async().await;
    }

    #[test]
    fn test_part_backoff_is_capped() {
        assert_eq!(part_backoff(1), Duration::from_millis(500));
        assert_eq!(part_backoff(3), Duration::from_secs(2));
        assert_eq!(part_backoff(6), Duration::from_secs(16));
        assert_eq!(part_backoff(60), Duration::from_secs(16));
        assert_eq!(part_backoff(u32::MAX), Duration::from_secs(16));
    }

    const PART: u64 = 5 * 1024 * 1024;
    const BIG_KEY_PATH: &str = r"^/bucket/model/1\.0\.0/big\.bin$";

    /// Backend splitting uploads into 5 MiB parts. SDK-level retries are
    /// off so only the per-part retry loop runs.
    async fn multipart_backend(server: &Server, part_retries: u32) -> ObjectStoreBackend {
        let mut s = settings(&server.url());
        s.part_size = PART;
        s.multipart_threshold = PART;
        s.max_concurrency = Some(4);
        s.part_retries = part_retries;
        let store = ObjectStoreBackend::new(ObjectStoreConfig::from_settings(&s).unwrap())
            .await
            .unwrap();
        let conf = store
            .client
            .config()
            .to_builder()
            .retry_config(s3::config::retry::RetryConfig::disabled())
            .build();
        ObjectStoreBackend {
            client: s3::Client::from_conf(conf),
            ..store
        }
    }

    /// 11 MiB: parts of 5, 5 and 1 MiB.
    fn big_file(dir: &Path) -> PathBuf {
        let path = dir.join("big.bin");
        let data: Vec<u8> = (0..2 * PART + 1024 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn mock_create(server: &mut Server) -> mockito::Mock {
        server
            .mock("POST", Matcher::Regex(BIG_KEY_PATH.to_string()))
            .match_query(Matcher::Regex(r"(^|&)uploads(=|&|$)".to_string()))
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>bucket</Bucket>
  <Key>model/1.0.0/big.bin</Key>
  <UploadId>UP1</UploadId>
</InitiateMultipartUploadResult>"#,
            )
            .create_async()
            .await
    }

    fn part_query(number: u32) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("partNumber".to_string(), number.to_string()),
            Matcher::UrlEncoded("uploadId".to_string(), "UP1".to_string()),
        ])
    }

    async fn mock_part_ok(server: &mut Server, number: u32) -> mockito::Mock {
        server
            .mock("PUT", Matcher::Regex(BIG_KEY_PATH.to_string()))
            .match_query(part_query(number))
            .with_status(200)
            .with_header("etag", &format!("\"etag-{number}\""))
            .create_async()
            .await
    }

    async fn mock_part_error(
        server: &mut Server,
        number: u32,
        status: usize,
        code: &str,
        hits: usize,
    ) -> mockito::Mock {
        server
            .mock("PUT", Matcher::Regex(BIG_KEY_PATH.to_string()))
            .match_query(part_query(number))
            .with_status(status)
            .with_header("content-type", "application/xml")
            .with_body(format!(
                "<Error><Code>{code}</Code><Message>try again</Message></Error>"
            ))
            .expect(hits)
            .create_async()
            .await
    }

    async fn mock_complete(server: &mut Server, hits: usize) -> mockito::Mock {
        server
            .mock("POST", Matcher::Regex(BIG_KEY_PATH.to_string()))
            .match_query(Matcher::UrlEncoded("uploadId".to_string(), "UP1".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(
                    r"(?s)<PartNumber>1</PartNumber>.*<PartNumber>2</PartNumber>.*<PartNumber>3</PartNumber>"
                        .to_string(),
                ),
                Matcher::Regex(r"(?s)etag-1.*etag-2.*etag-3".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>bucket</Bucket>
  <Key>model/1.0.0/big.bin</Key>
  <ETag>"etag-final"</ETag>
</CompleteMultipartUploadResult>"#,
            )
            .expect(hits)
            .create_async()
            .await
    }

    async fn mock_abort(server: &mut Server, hits: usize) -> mockito::Mock {
        server
            .mock("DELETE", Matcher::Regex(BIG_KEY_PATH.to_string()))
            .match_query(Matcher::UrlEncoded("uploadId".to_string(), "UP1".to_string()))
            .with_status(204)
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_multipart_upload_completes_parts_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let local = big_file(tmp.path());
        let mut server = Server::new_async().await;
        let create = mock_create(&mut server).await;
        let mut parts = Vec::new();
        for n in 1..=3 {
            parts.push(mock_part_ok(&mut server, n).await);
        }
        let complete = mock_complete(&mut server, 1).await;
        let abort = mock_abort(&mut server, 0).await;

        let store = multipart_backend(&server, 0).await;
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let sent = store
            .upload(
                &local,
                "model/1.0.0/big.bin",
                Some(Arc::new(move |done, _| {
                    s.fetch_max(done, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        assert_eq!(sent, 2 * PART + 1024 * 1024);
        assert_eq!(seen.load(Ordering::SeqCst), sent);
        create.assert_async().await;
        for part in parts {
            part.assert_async().await;
        }
        complete.assert_async().await;
        abort.assert_async().await;
    }

    #[tokio::test]
    async fn test_multipart_retries_a_failed_part() {
        let tmp = tempfile::tempdir().unwrap();
        let local = big_file(tmp.path());
        let mut server = Server::new_async().await;
        let _create = mock_create(&mut server).await;
        let _one = mock_part_ok(&mut server, 1).await;
        // Created first, so it answers the first attempt only.
        let flaky = mock_part_error(&mut server, 2, 503, "SlowDown", 1).await;
        let two = mock_part_ok(&mut server, 2).await;
        let _three = mock_part_ok(&mut server, 3).await;
        let complete = mock_complete(&mut server, 1).await;

        let store = multipart_backend(&server, 2).await;
        store
            .upload(&local, "model/1.0.0/big.bin", None)
            .await
            .unwrap();

        flaky.assert_async().await;
        two.assert_async().await;
        complete.assert_async().await;
    }

    #[tokio::test]
    async fn test_multipart_aborts_when_a_part_keeps_failing() {
        let tmp = tempfile::tempdir().unwrap();
        let local = big_file(tmp.path());
        let mut server = Server::new_async().await;
        let _create = mock_create(&mut server).await;
        let _one = mock_part_ok(&mut server, 1).await;
        let broken = mock_part_error(&mut server, 2, 500, "InternalError", 2).await;
        let _three = mock_part_ok(&mut server, 3).await;
        let complete = mock_complete(&mut server, 0).await;
        let abort = mock_abort(&mut server, 1).await;

        let store = multipart_backend(&server, 1).await;
        let err = store
            .upload(&local, "model/1.0.0/big.bin", None)
            .await
            .unwrap_err();

        assert!(matches!(&err, StorageError::Remote { code, .. } if code == "InternalError"));
        broken.assert_async().await;
        complete.assert_async().await;
        abort.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_parses_listing() {
        let mut server = Server::new_async().await;
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>model/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>model/2.0.0/b.tar.gz</Key><Size>2</Size></Contents>
  <Contents><Key>model/1.0.0/a.tar.gz</Key><Size>1</Size></Contents>
</ListBucketResult>"#;
        let _m = server
            .mock("GET", Matcher::Regex(r"^/bucket/?(\?.*)?$".to_string()))
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(body)
            .create_async()
            .await;

        let store = backend(&server).await;
        assert_eq!(
            store.list("model/").await.unwrap(),
            vec!["model/1.0.0/a.tar.gz", "model/2.0.0/b.tar.gz"]
        );
    }
}
