//! Storage abstraction: one transfer contract over every backend.
//!
//! Keys are `/`-separated and backend-agnostic (see
//! [`stowage_schema::layout`]). Backends raise typed errors and never retry
//! at the operation level; the only retries live inside a multipart upload,
//! per part.

mod fs;
mod s3;

pub use fs::FilesystemBackend;
pub use s3::{ObjectStoreBackend, ObjectStoreConfig};

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_schema::Sha256Digest;
use thiserror::Error;

use crate::cancel::{CancelToken, Cancelled};
use crate::config::StorageSettings;
use crate::reporter::ProgressFn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied for '{key}': {message}")]
    PermissionDenied { key: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Insufficient disk space: {0}")]
    DiskSpace(String),

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("Storage service error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer cancelled by user")]
    Cancelled,
}

impl From<Cancelled> for StorageError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl StorageError {
    /// Network-level failures that may succeed when tried again.
    ///
    /// Permission, configuration and missing-object errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Remote { code, .. } => matches!(
                code.as_str(),
                "InternalError" | "ServiceUnavailable" | "SlowDown" | "RequestTimeout" | "500"
                    | "502" | "503" | "504"
            ),
            _ => false,
        }
    }

    /// Map an I/O error raised while touching `key`.
    pub(crate) fn from_io(err: std::io::Error, key: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(key.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied {
                key: key.to_string(),
                message: err.to_string(),
            },
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Self::DiskSpace(format!("{key}: {err}")),
            _ => Self::Io(err),
        }
    }
}

/// Which backend implementation serves the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Filesystem,
    S3,
    Bos,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::S3 => "s3",
            Self::Bos => "bos",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" | "local" => Ok(Self::Filesystem),
            "s3" => Ok(Self::S3),
            "bos" => Ok(Self::Bos),
            other => Err(StorageError::Config(format!(
                "unknown storage kind '{other}' (expected filesystem, s3 or bos)"
            ))),
        }
    }
}

/// What [`StorageBackend::get_metadata`] knows about an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Content digest when the backend has one on record.
    pub checksum: Option<Sha256Digest>,
}

/// Uniform transfer contract over a remote store.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Human-readable location, e.g. `s3://bucket` or a directory path.
    fn location(&self) -> String;

    /// Copy `local` to `key`. Returns the number of bytes transferred.
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError>;

    /// Copy `key` to `local`, replacing it. Returns the number of bytes transferred.
    async fn download(
        &self,
        key: &str,
        local: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn get_metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError>;
}

/// Normalize a storage key: `/` separators, no leading slash, no `..`.
pub fn normalize_key(key: &str) -> Result<String, StorageError> {
    let cleaned = key.replace('\\', "/");
    let parts: Vec<&str> = cleaned
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() || parts.contains(&"..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(parts.join("/"))
}

/// Build the backend selected by `settings`.
///
/// `settings` should already carry environment fallbacks (see
/// [`StorageSettings::with_env`]); this function reads no environment of
/// its own apart from the AWS default provider chain for an `s3` store
/// with no explicit credentials.
pub async fn create_backend(
    settings: &StorageSettings,
    cancel: CancelToken,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    tracing::debug!(kind = %settings.kind, "creating storage backend");
    match settings.kind {
        BackendKind::Filesystem => {
            let root = settings.path.clone().ok_or_else(|| {
                StorageError::Config(
                    "filesystem storage needs `storage.path` (or STOWAGE_STORAGE_PATH)".to_string(),
                )
            })?;
            Ok(Arc::new(FilesystemBackend::new(root).with_cancel(cancel)))
        }
        BackendKind::S3 | BackendKind::Bos => {
            let config = ObjectStoreConfig::from_settings(settings)?;
            let backend = ObjectStoreBackend::new(config).await?.with_cancel(cancel);
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("/model/1.0.0/a.tar.gz").unwrap(), "model/1.0.0/a.tar.gz");
        assert_eq!(normalize_key("releases\\x.json").unwrap(), "releases/x.json");
        assert!(normalize_key("model/../etc").is_err());
        assert!(normalize_key("").is_err());
        assert!(normalize_key("//").is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::Connection("reset".into()).is_retryable());
        assert!(
            StorageError::Remote {
                code: "SlowDown".into(),
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !StorageError::PermissionDenied {
                key: "k".into(),
                message: "no".into()
            }
            .is_retryable()
        );
        assert!(!StorageError::NotFound("k".into()).is_retryable());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert_eq!("fs".parse::<BackendKind>().unwrap(), BackendKind::Filesystem);
        assert!("ftp".parse::<BackendKind>().is_err());
    }

    #[tokio::test]
    async fn test_factory_requires_filesystem_root() {
        let settings = StorageSettings::default();
        let err = create_backend(&settings, CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));

        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings {
            path: Some(dir.path().to_path_buf()),
            ..StorageSettings::default()
        };
        let backend = create_backend(&settings, CancelToken::new()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Filesystem);
    }
}
