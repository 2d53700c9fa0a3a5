//! Local index of known component versions.
//!
//! The index is a cache over `deployment/manifests`: losing or corrupting
//! it is harmless, because it is rebuilt by scanning the manifests, which
//! are never modified by the rebuild. Writers serialize on a sibling lock
//! file and re-read the index under the lock before applying their change,
//! so concurrent invocations do not drop each other's entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_schema::{Component, ComponentType, Manifest, Sha256Digest, Version};
use thiserror::Error;

use crate::lock::{FileLock, LockError, write_atomic};
use crate::manifest::ManifestEngine;
use crate::paths::ProjectPaths;

/// Index format version.
pub const INDEX_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to write index {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode index: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// One known version of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub version: Version,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Manifest file, relative to the project root.
    pub manifest_path: String,
    #[serde(default)]
    pub archive_path: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<Sha256Digest>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// On-disk document: `{version, updated_at, components: {type: [entry]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentIndex {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    pub components: BTreeMap<String, Vec<IndexEntry>>,
}

impl Default for ComponentIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            updated_at: Utc::now(),
            components: BTreeMap::new(),
        }
    }
}

impl ComponentIndex {
    fn upsert(&mut self, kind: &str, entry: IndexEntry) {
        let entries = self.components.entry(kind.to_string()).or_default();
        entries.retain(|e| e.version != entry.version);
        entries.push(entry);
        // Newest first, semantic ordering.
        entries.sort_by(|a, b| b.version.cmp(&a.version));
    }

    fn remove(&mut self, component: &Component) -> bool {
        let Some(entries) = self.components.get_mut(component.kind.as_str()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.version != component.version);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.components.remove(component.kind.as_str());
        }
        removed
    }
}

/// Per-type summary returned by [`ComponentRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub versions: usize,
    pub total_size: u64,
    pub latest: Option<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_versions: usize,
    pub total_size: u64,
    pub types: BTreeMap<String, TypeStats>,
}

#[derive(Debug)]
pub struct ComponentRegistry {
    engine: ManifestEngine,
    index_path: PathBuf,
    index: ComponentIndex,
}

impl ComponentRegistry {
    /// Load the index, rebuilding it from manifests if missing or unreadable.
    pub fn open(paths: ProjectPaths) -> Result<Self, RegistryError> {
        let index_path = paths.index_file();
        let engine = ManifestEngine::new(paths);
        let mut registry = Self {
            engine,
            index_path,
            index: ComponentIndex::default(),
        };

        match read_index(&registry.index_path) {
            Some(index) => registry.index = index,
            None => registry.refresh()?,
        }
        Ok(registry)
    }

    pub fn index(&self) -> &ComponentIndex {
        &self.index
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Upsert the entry for `manifest`, stored at `manifest_path`.
    pub fn register(&mut self, manifest: &Manifest, manifest_path: &Path) -> Result<IndexEntry, RegistryError> {
        let entry = self.entry_for(manifest, manifest_path);
        let kind = manifest.package.kind.to_string();
        let stored = entry.clone();
        self.mutate(move |index| index.upsert(&kind, entry))?;
        tracing::debug!(component = %manifest.component(), "registered");
        Ok(stored)
    }

    /// Drop `component` from the index. Returns whether it was present.
    pub fn unregister(&mut self, component: &Component) -> Result<bool, RegistryError> {
        let component = component.clone();
        self.mutate(move |index| index.remove(&component))
    }

    /// Discard the index and rebuild it from the manifests on disk.
    pub fn refresh(&mut self) -> Result<(), RegistryError> {
        let scanned = self.scan();
        let _lock = FileLock::acquire(&FileLock::path_for(&self.index_path))?;
        self.index = scanned;
        self.persist()?;
        tracing::info!(
            types = self.index.components.len(),
            path = %self.index_path.display(),
            "component index rebuilt"
        );
        Ok(())
    }

    pub fn find(&self, component: &Component) -> Option<&IndexEntry> {
        self.index
            .components
            .get(component.kind.as_str())?
            .iter()
            .find(|e| e.version == component.version)
    }

    /// Versions of `kind`, newest first.
    pub fn list_versions(&self, kind: &str) -> Vec<&Version> {
        self.index
            .components
            .get(kind)
            .map(|entries| entries.iter().map(|e| &e.version).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, kind: &str) -> Option<&IndexEntry> {
        self.index.components.get(kind)?.first()
    }

    /// Case-insensitive substring match on the type, or on the version.
    pub fn search(&self, query: &str) -> Vec<Component> {
        let needle = query.to_lowercase();
        let needle = needle.as_str();
        self.index
            .components
            .iter()
            .flat_map(|(kind, entries)| {
                let kind_hit = kind.to_lowercase().contains(needle);
                entries
                    .iter()
                    .filter(move |e| kind_hit || e.version.to_lowercase().contains(needle))
                    .map(move |e| Component::new(ComponentType::new(kind.clone()), e.version.clone()))
            })
            .collect()
    }

    pub fn component_types(&self) -> Vec<&str> {
        self.index.components.keys().map(String::as_str).collect()
    }

    /// All components, optionally of one type, newest first within a type.
    pub fn list_components(&self, kind: Option<&str>, limit: Option<usize>) -> Vec<Component> {
        self.index
            .components
            .iter()
            .filter(|(k, _)| kind.is_none_or(|want| want == k.as_str()))
            .flat_map(|(k, entries)| {
                entries
                    .iter()
                    .map(move |e| Component::new(ComponentType::new(k.clone()), e.version.clone()))
            })
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for (kind, entries) in &self.index.components {
            let size: u64 = entries.iter().filter_map(|e| e.size).sum();
            stats.total_versions += entries.len();
            stats.total_size += size;
            stats.types.insert(
                kind.clone(),
                TypeStats {
                    versions: entries.len(),
                    total_size: size,
                    latest: entries.first().map(|e| e.version.clone()),
                },
            );
        }
        stats
    }

    fn entry_for(&self, manifest: &Manifest, manifest_path: &Path) -> IndexEntry {
        let paths = self.engine.paths();
        IndexEntry {
            version: manifest.package.version.clone(),
            created_at: manifest.package.created_at,
            manifest_path: paths.relative(manifest_path),
            archive_path: manifest.archive.location.clone(),
            size: manifest.archive.size,
            checksum: manifest.archive.checksum.sha256.clone(),
            metadata: manifest.metadata.clone(),
        }
    }

    fn scan(&self) -> ComponentIndex {
        let mut index = ComponentIndex::default();
        for (path, manifest) in self.engine.list_manifests(None) {
            if manifest.package.kind.is_empty() || manifest.package.version.is_empty() {
                continue;
            }
            let entry = self.entry_for(&manifest, &path);
            index.upsert(manifest.package.kind.as_str(), entry);
        }
        index
    }

    /// Apply `f` to the freshest on-disk index while holding the writer lock.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut ComponentIndex) -> R) -> Result<R, RegistryError> {
        let _lock = FileLock::acquire(&FileLock::path_for(&self.index_path))?;
        self.index = read_index(&self.index_path).unwrap_or_else(|| self.scan());
        let out = f(&mut self.index);
        self.persist()?;
        Ok(out)
    }

    fn persist(&mut self) -> Result<(), RegistryError> {
        self.index.version = INDEX_VERSION.to_string();
        self.index.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&self.index)?;
        write_atomic(&self.index_path, &json).map_err(|source| RegistryError::Write {
            path: self.index_path.clone(),
            source,
        })
    }
}

fn read_index(path: &Path) -> Option<ComponentIndex> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(index) => Some(index),
        Err(e) => {
            tracing::warn!(path = %path.display(), "component index unreadable, rebuilding: {e}");
            None
        }
    }
}
