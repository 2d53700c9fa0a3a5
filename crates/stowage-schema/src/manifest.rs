//! Component manifest wire format.
//!
//! Every field tolerates absence at parse time so that
//! [`Manifest::missing_fields`] can report all gaps at once instead of
//! failing on the first one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hash::{Blake3Hash, Sha256Digest};
use crate::types::{Component, ComponentType, Version};

/// Manifest format version written by this crate.
pub const MANIFEST_VERSION: &str = "1.0";

fn default_manifest_version() -> String {
    MANIFEST_VERSION.to_string()
}

/// Metadata record describing one packaged component and its archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version of this document.
    #[serde(default = "default_manifest_version")]
    pub manifest_version: String,
    /// Package identity and creation time.
    #[serde(default)]
    pub package: PackageInfo,
    /// Archive filename, size, digests and storage location.
    #[serde(default)]
    pub archive: ArchiveInfo,
    /// Host that produced the archive.
    #[serde(default)]
    pub build: BuildInfo,
    /// Free-form user metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The `package` section of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Component type tag.
    #[serde(rename = "type", default)]
    pub kind: ComponentType,
    /// Display name; defaults to the type tag.
    #[serde(default)]
    pub name: String,
    /// Component version.
    #[serde(default)]
    pub version: Version,
    /// When the manifest was created.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Source path the archive was built from, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The `archive` section of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Archive file name, e.g. `model-1.0.0.tar.gz`.
    #[serde(default)]
    pub filename: String,
    /// Archive size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Digests of the archive bytes keyed by algorithm.
    #[serde(default)]
    pub checksum: Checksums,
    /// Local relative path before publishing, storage key afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Compression algorithm name (`gzip`, `zstd`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Files contained in the archive; the verification set on deploy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
}

/// Checksum map of a manifest archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    /// SHA-256 of the archive bytes. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<Sha256Digest>,
    /// BLAKE3 of the archive bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blake3: Option<Blake3Hash>,
}

/// One regular file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the archive root, `/`-separated.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<Sha256Digest>,
}

/// The `build` section of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Hostname of the packing machine.
    #[serde(default)]
    pub host: String,
    /// User that ran the pack.
    #[serde(default)]
    pub user: String,
    /// Working directory at pack time.
    #[serde(default)]
    pub cwd: String,
    /// Version of the packing tool.
    #[serde(default)]
    pub tool_version: String,
}

impl Manifest {
    /// Create a manifest with the current format version and empty sections.
    pub fn new(component: &Component) -> Self {
        Self {
            manifest_version: default_manifest_version(),
            package: PackageInfo {
                kind: component.kind.clone(),
                name: component.kind.to_string(),
                version: component.version.clone(),
                created_at: Some(Utc::now()),
                source: None,
            },
            archive: ArchiveInfo::default(),
            build: BuildInfo::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// The `(type, version)` identity this manifest describes.
    pub fn component(&self) -> Component {
        Component::new(self.package.kind.clone(), self.package.version.clone())
    }

    /// Dotted names of every required field that is absent or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.package.kind.is_empty() {
            missing.push("package.type");
        }
        if self.package.version.is_empty() {
            missing.push("package.version");
        }
        if self.package.created_at.is_none() {
            missing.push("package.created_at");
        }
        if self.archive.filename.is_empty() {
            missing.push("archive.filename");
        }
        if self.archive.size.is_none() {
            missing.push("archive.size");
        }
        if self.archive.checksum.sha256.is_none() {
            missing.push("archive.checksum.sha256");
        }
        missing
    }
}
