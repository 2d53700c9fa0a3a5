//! Project settings from `stowage.toml`, with environment fallbacks.
//!
//! Explicit values always win. Environment variables only fill fields the
//! file leaves empty, and they are read through an injected lookup so
//! callers (and tests) decide where the environment comes from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::{ArchiveError, Compression, ExcludeFilter};
use crate::storage::BackendKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid pack settings: {0}")]
    Pack(#[from] ArchiveError),
}

/// Top-level `stowage.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub pack: PackSettings,
}

/// `[storage]` table.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: BackendKind,
    /// Root directory of a filesystem store.
    pub path: Option<PathBuf>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: Option<bool>,
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Parallel part transfers. Defaults to the CPU count, clamped to 2..=16.
    pub max_concurrency: Option<usize>,
    pub part_retries: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Filesystem,
            path: None,
            bucket: None,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            force_path_style: None,
            multipart_threshold: 100 * 1024 * 1024,
            part_size: 10 * 1024 * 1024,
            max_concurrency: None,
            part_retries: 3,
        }
    }
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl StorageSettings {
    /// Filesystem store rooted at `path`.
    pub fn filesystem(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Filesystem,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Fill unset fields from the environment.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        match self.kind {
            BackendKind::Filesystem => {
                if self.path.is_none() {
                    self.path = get("STOWAGE_STORAGE_PATH").map(PathBuf::from);
                }
            }
            BackendKind::S3 => {
                self.access_key = self.access_key.or_else(|| get("AWS_ACCESS_KEY_ID"));
                self.secret_key = self.secret_key.or_else(|| get("AWS_SECRET_ACCESS_KEY"));
                self.region = self
                    .region
                    .or_else(|| get("AWS_REGION"))
                    .or_else(|| get("AWS_DEFAULT_REGION"));
            }
            BackendKind::Bos => {
                self.access_key = self.access_key.or_else(|| get("BOS_ACCESS_KEY"));
                self.secret_key = self.secret_key.or_else(|| get("BOS_SECRET_KEY"));
                self.endpoint = self.endpoint.or_else(|| get("BOS_ENDPOINT"));
            }
        }
        self
    }
}

/// `[pack]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackSettings {
    pub compression: Compression,
    pub level: Option<u32>,
    /// Replaces the built-in exclude list when set.
    pub exclude: Option<Vec<String>>,
}

impl Default for PackSettings {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            level: Some(6),
            exclude: None,
        }
    }
}

impl PackSettings {
    pub fn exclude_filter(&self) -> Result<ExcludeFilter, ArchiveError> {
        match &self.exclude {
            Some(patterns) => ExcludeFilter::new(patterns),
            None => Ok(ExcludeFilter::defaults()),
        }
    }
}

impl Settings {
    /// Parse a settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.pack.exclude_filter()?;
        settings
            .pack
            .compression
            .resolve_level(settings.pack.level)?;
        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// [`Settings::load`] if the file exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment fallbacks to the storage table.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.storage = self.storage.with_env(lookup);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_parse_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(
            &path,
            r#"
[storage]
kind = "s3"
bucket = "artifacts"
region = "eu-west-1"
part_size = 8388608

[pack]
compression = "zstd"
level = 19
exclude = ["*.log"]
"#,
        )
        .unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.storage.kind, BackendKind::S3);
        assert_eq!(s.storage.bucket.as_deref(), Some("artifacts"));
        assert_eq!(s.storage.part_size, 8_388_608);
        assert_eq!(s.storage.multipart_threshold, 100 * 1024 * 1024);
        assert_eq!(s.pack.compression, Compression::Zstd);
        assert_eq!(s.pack.level, Some(19));
    }

    #[test]
    fn test_invalid_level_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(&path, "[pack]\ncompression = \"gzip\"\nlevel = 12\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Pack(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let s = Settings::load_or_default(Path::new("/no/such/stowage.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_explicit_values_beat_env() {
        let storage = StorageSettings {
            kind: BackendKind::S3,
            access_key: Some("explicit".into()),
            ..StorageSettings::default()
        }
        .with_env(env(&[
            ("AWS_ACCESS_KEY_ID", "from-env"),
            ("AWS_SECRET_ACCESS_KEY", "env-secret"),
            ("AWS_REGION", "ap-south-1"),
        ]));
        assert_eq!(storage.access_key.as_deref(), Some("explicit"));
        assert_eq!(storage.secret_key.as_deref(), Some("env-secret"));
        assert_eq!(storage.region.as_deref(), Some("ap-south-1"));
    }

    #[test]
    fn test_env_per_backend() {
        let fs = StorageSettings::default().with_env(env(&[("STOWAGE_STORAGE_PATH", "/srv/store")]));
        assert_eq!(fs.path.as_deref(), Some(Path::new("/srv/store")));

        let bos = StorageSettings {
            kind: BackendKind::Bos,
            ..StorageSettings::default()
        }
        .with_env(env(&[("BOS_ACCESS_KEY", "ak"), ("AWS_ACCESS_KEY_ID", "wrong")]));
        assert_eq!(bos.access_key.as_deref(), Some("ak"));
    }
}
