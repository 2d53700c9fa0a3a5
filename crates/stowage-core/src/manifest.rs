//! Manifest engine: create, persist, validate and look up component manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use stowage_schema::{BuildInfo, Component, Manifest, Sha256Digest};
use thiserror::Error;
use walkdir::WalkDir;

use crate::archive::{ArchiveStats, Compression};
use crate::checksum::{digest_file_async, sha256_file_async};
use crate::lock::write_atomic;
use crate::paths::ProjectPaths;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest not found for {0}")]
    NotFound(Component),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest for {component} is missing required fields: {}", fields.join(", "))]
    MissingFields {
        component: String,
        fields: Vec<String>,
    },

    #[error("Archive size mismatch for {filename}: manifest says {expected}, found {actual}")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("Archive not found: {}", .0.display())]
    ArchiveMissing(PathBuf),
}

/// Inputs to [`ManifestEngine::create_manifest`].
#[derive(Debug, Clone)]
pub struct ManifestInput<'a> {
    pub component: &'a Component,
    pub source: &'a Path,
    pub archive: &'a Path,
    /// Stats from the pack that produced `archive`; supplies the file list.
    pub stats: Option<&'a ArchiveStats>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Manifest operations over one project's `deployment/manifests` tree.
#[derive(Debug, Clone)]
pub struct ManifestEngine {
    paths: ProjectPaths,
}

impl ManifestEngine {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Digest an archive and describe it.
    pub async fn create_manifest(&self, input: ManifestInput<'_>) -> Result<Manifest, ManifestError> {
        let digests = digest_file_async(input.archive.to_path_buf())
            .await
            .map_err(|source| ManifestError::Read {
                path: input.archive.to_path_buf(),
                source,
            })?;

        let mut manifest = Manifest::new(input.component);
        manifest.package.source = Some(self.paths.relative(input.source));
        manifest.archive.filename = input
            .archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        manifest.archive.size = Some(digests.size);
        manifest.archive.checksum.sha256 = Some(digests.sha256);
        manifest.archive.checksum.blake3 = Some(digests.blake3);
        manifest.archive.location = Some(self.paths.relative(input.archive));
        manifest.archive.compression = input
            .stats
            .map(|s| s.compression)
            .or_else(|| Compression::from_path(input.archive))
            .map(|c| c.name().to_string());
        manifest.archive.files = input
            .stats
            .map(|s| s.entries.clone())
            .unwrap_or_default();
        manifest.build = build_info();
        manifest.metadata = input.metadata;

        tracing::debug!(
            component = %input.component,
            size = digests.size,
            "manifest created"
        );
        Ok(manifest)
    }

    /// Persist at the canonical location; returns the path written.
    pub fn save_manifest(&self, manifest: &Manifest) -> Result<PathBuf, ManifestError> {
        let path = self.paths.manifest_path(&manifest.component());
        save_manifest_to(&path, manifest)?;
        Ok(path)
    }

    /// Canonical path, then the flat `{type}-{version}.manifest.json` name.
    /// `None` when neither exists.
    pub fn find_manifest(&self, component: &Component) -> Option<PathBuf> {
        [
            self.paths.manifest_path(component),
            self.paths.flat_manifest_path(component),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }

    /// Load the manifest of `component`, failing if it has none.
    pub fn load_component(&self, component: &Component) -> Result<Manifest, ManifestError> {
        let path = self
            .find_manifest(component)
            .ok_or_else(|| ManifestError::NotFound(component.clone()))?;
        load_manifest(&path)
    }

    /// Every parseable manifest, optionally restricted to one type.
    /// Unreadable files are skipped with a warning.
    pub fn list_manifests(&self, kind: Option<&str>) -> Vec<(PathBuf, Manifest)> {
        if !self.paths.manifests_dir.is_dir() {
            return Vec::new();
        }
        let mut out: Vec<(PathBuf, Manifest)> = WalkDir::new(&self.paths.manifests_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| match load_manifest(e.path()) {
                Ok(m) => Some((e.into_path(), m)),
                Err(err) => {
                    tracing::warn!("skipping manifest: {err}");
                    None
                }
            })
            .filter(|(_, m)| kind.is_none_or(|k| m.package.kind == k))
            .collect();
        out.sort_by(|a, b| {
            a.1.package
                .kind
                .cmp(&b.1.package.kind)
                .then_with(|| a.1.package.version.cmp(&b.1.package.version))
        });
        out
    }
}

/// Write a manifest as pretty JSON, atomically.
pub fn save_manifest_to(path: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &json).map_err(|source| ManifestError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let bytes = std::fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Check required fields, listing every one that is missing.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    let missing = manifest.missing_fields();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ManifestError::MissingFields {
        component: manifest.component().to_string(),
        fields: missing.into_iter().map(ToString::to_string).collect(),
    })
}

/// Compare an archive on disk against the manifest's size and SHA-256.
pub async fn verify_archive(manifest: &Manifest, archive: &Path) -> Result<(), ManifestError> {
    validate_manifest(manifest)?;
    let filename = manifest.archive.filename.clone();

    let meta = tokio::fs::metadata(archive)
        .await
        .map_err(|_| ManifestError::ArchiveMissing(archive.to_path_buf()))?;
    if let Some(expected) = manifest.archive.size
        && expected != meta.len()
    {
        return Err(ManifestError::SizeMismatch {
            filename,
            expected,
            actual: meta.len(),
        });
    }

    let actual = sha256_file_async(archive.to_path_buf())
        .await
        .map_err(|source| ManifestError::Read {
            path: archive.to_path_buf(),
            source,
        })?;
    match &manifest.archive.checksum.sha256 {
        Some(expected) if *expected != actual => Err(ManifestError::ChecksumMismatch {
            filename,
            expected: expected.clone(),
            actual,
        }),
        _ => Ok(()),
    }
}

fn build_info() -> BuildInfo {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    BuildInfo {
        host,
        user,
        cwd,
        tool_version: crate::TOOL_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archiver, Destination};

    async fn packed(paths: &ProjectPaths) -> (Component, PathBuf, ArchiveStats) {
        let src = paths.root.join("model");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("weights.bin"), vec![1u8; 4096]).unwrap();
        std::fs::write(src.join("config.json"), b"{}").unwrap();

        let archive = paths.archive_path("model-1.0.0.tar.gz");
        let out = Archiver::default()
            .compress(&[src], Destination::File(archive.clone()))
            .await
            .unwrap();
        (Component::new("model", "1.0.0"), archive, out.stats)
    }

    #[tokio::test]
    async fn test_create_save_find_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::at(dir.path());
        let engine = ManifestEngine::new(paths.clone());
        let (component, archive, stats) = packed(&paths).await;

        let manifest = engine
            .create_manifest(ManifestInput {
                component: &component,
                source: &paths.root.join("model"),
                archive: &archive,
                stats: Some(&stats),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(manifest.archive.filename, "model-1.0.0.tar.gz");
        assert_eq!(manifest.archive.location.as_deref(), Some("dist/model-1.0.0.tar.gz"));
        assert_eq!(manifest.archive.compression.as_deref(), Some("gzip"));
        assert_eq!(manifest.archive.files.len(), 2);
        assert!(manifest.archive.checksum.blake3.is_some());
        validate_manifest(&manifest).unwrap();
        verify_archive(&manifest, &archive).await.unwrap();

        let saved = engine.save_manifest(&manifest).unwrap();
        assert_eq!(engine.find_manifest(&component), Some(saved));
        assert_eq!(engine.load_component(&component).unwrap(), manifest);
        assert_eq!(engine.list_manifests(Some("model")).len(), 1);
        assert!(engine.list_manifests(Some("config")).is_empty());
    }

    #[tokio::test]
    async fn test_tampered_archive_detected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::at(dir.path());
        let engine = ManifestEngine::new(paths.clone());
        let (component, archive, stats) = packed(&paths).await;
        let manifest = engine
            .create_manifest(ManifestInput {
                component: &component,
                source: &paths.root,
                archive: &archive,
                stats: Some(&stats),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        let mut bytes = std::fs::read(&archive).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&archive, bytes).unwrap();

        assert!(matches!(
            verify_archive(&manifest, &archive).await,
            Err(ManifestError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_absent_manifest_is_not_an_error_at_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ManifestEngine::new(ProjectPaths::at(dir.path()));
        let c = Component::new("model", "9.9.9");
        assert!(engine.find_manifest(&c).is_none());
        assert!(matches!(engine.load_component(&c), Err(ManifestError::NotFound(_))));
    }

    #[test]
    fn test_flat_name_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::at(dir.path());
        let engine = ManifestEngine::new(paths.clone());
        let c = Component::new("config", "2.0.0");
        let mut m = Manifest::new(&c);
        m.archive.filename = "config-2.0.0.tar.gz".into();
        save_manifest_to(&paths.flat_manifest_path(&c), &m).unwrap();
        assert_eq!(engine.find_manifest(&c), Some(paths.flat_manifest_path(&c)));
    }

    #[test]
    fn test_validation_lists_all_missing() {
        let m: Manifest = serde_json::from_str("{}").unwrap();
        match validate_manifest(&m) {
            Err(ManifestError::MissingFields { fields, .. }) => assert_eq!(fields.len(), 6),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
