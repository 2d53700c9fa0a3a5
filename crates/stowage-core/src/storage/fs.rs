//! Local-directory backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

use super::{BackendKind, ObjectMetadata, StorageBackend, StorageError, normalize_key};
use crate::cancel::CancelToken;
use crate::checksum::{CHUNK_SIZE, sha256_file_async};
use crate::reporter::ProgressFn;

/// Suffix of in-flight copies; such files are never listed.
const PART_SUFFIX: &str = ".stowage-part";

/// Stores objects as files under a root directory, one file per key.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
    cancel: CancelToken,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<(String, PathBuf), StorageError> {
        let key = normalize_key(key)?;
        let path = key.split('/').fold(self.root.clone(), |p, part| p.join(part));
        Ok((key, path))
    }

    /// Chunked copy through a sibling temp file, renamed into place at the end.
    async fn copy(
        &self,
        src: &Path,
        dst: &Path,
        key: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, StorageError> {
        let mut reader = tokio::fs::File::open(src)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        let total = reader
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(e, key))?
            .len();

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, key))?;
        }
        let mut part_name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        part_name.push(PART_SUFFIX);
        let part = dst.with_file_name(part_name);

        let result = self.stream(&mut reader, &part, total, key, progress).await;
        match result {
            Ok(copied) => {
                tokio::fs::rename(&part, dst)
                    .await
                    .map_err(|e| StorageError::from_io(e, key))?;
                Ok(copied)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn stream(
        &self,
        reader: &mut tokio::fs::File,
        part: &Path,
        total: u64,
        key: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, StorageError> {
        let mut writer = tokio::fs::File::create(part)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;

        if let Some(progress) = progress {
            progress(0, total);
        }
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::from_io(e, key))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| StorageError::from_io(e, key))?;
            copied += n as u64;
            if let Some(progress) = progress {
                progress(copied, total.max(copied));
            }
            self.cancel.checkpoint()?;
        }
        writer
            .sync_all()
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        Ok(copied)
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError> {
        let (key, dst) = self.path_for(key)?;
        let bytes = self.copy(local, &dst, &key, progress.as_ref()).await?;
        tracing::debug!(%key, bytes, "stored");
        Ok(bytes)
    }

    async fn download(
        &self,
        key: &str,
        local: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError> {
        let (key, src) = self.path_for(key)?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key));
        }
        let bytes = self.copy(&src, local, &key, progress.as_ref()).await?;
        tracing::debug!(%key, bytes, "fetched");
        Ok(bytes)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (key, path) = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(e, &key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let (key, path) = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from_io(e, &key)),
        }

        // Prune directories left empty, up to the root.
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        tracing::debug!(%key, "deleted");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').replace('\\', "/");
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, StorageError> {
            if !root.is_dir() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    tracing::warn!(%path, "listing failed: {e}");
                    StorageError::from_io(e.into(), &path)
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.ends_with(PART_SUFFIX) && key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let (key, path) = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(e, &key))?;
        let checksum = sha256_file_async(path)
            .await
            .map_err(|e| StorageError::from_io(e, &key))?;
        Ok(ObjectMetadata {
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            checksum: Some(checksum),
        })
    }
}
