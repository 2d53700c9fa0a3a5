//! Project layout and project-root discovery.
//!
//! ```text
//! <root>/
//! ├── stowage.toml               # optional settings
//! ├── deployment/manifests/      # {type}/{version}.json
//! ├── deployment/releases/       # {version}.release.json
//! ├── dist/                      # packed archives
//! └── .stowage-cache/            # component_index.json
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use stowage_schema::layout;
use stowage_schema::{Component, ReleaseVersion};

/// Settings file name at the project root.
pub const CONFIG_FILE: &str = "stowage.toml";

/// Files or directories that mark a project root, in priority order.
pub const PROJECT_MARKERS: [&str; 3] = [CONFIG_FILE, "deployment", ".git"];

/// Resolved directories of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub manifests_dir: PathBuf,
    pub releases_dir: PathBuf,
    pub dist_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl ProjectPaths {
    /// Layout rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            manifests_dir: root.join("deployment").join("manifests"),
            releases_dir: root.join("deployment").join("releases"),
            dist_dir: root.join("dist"),
            cache_dir: root.join(".stowage-cache"),
            root,
        }
    }

    /// `stowage.toml` at the root.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Component index cache: `.stowage-cache/component_index.json`
    pub fn index_file(&self) -> PathBuf {
        self.cache_dir.join("component_index.json")
    }

    /// Canonical manifest location: `manifests/{type}/{version}.json`
    pub fn manifest_path(&self, component: &Component) -> PathBuf {
        self.manifests_dir
            .join(&component.kind)
            .join(format!("{}.json", component.version))
    }

    /// Flat manifest name also accepted on lookup:
    /// `manifests/{type}-{version}.manifest.json`
    pub fn flat_manifest_path(&self, component: &Component) -> PathBuf {
        self.manifests_dir
            .join(layout::manifest_filename(component))
    }

    /// Local release manifest: `releases/{version}.release.json`
    pub fn release_path(&self, version: &ReleaseVersion) -> PathBuf {
        self.releases_dir.join(layout::release_filename(version))
    }

    /// Packed archive in `dist/`.
    pub fn archive_path(&self, filename: &str) -> PathBuf {
        self.dist_dir.join(filename)
    }

    /// Path relative to the root, `/`-separated, for recording in manifests.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.manifests_dir,
            &self.releases_dir,
            &self.dist_dir,
            &self.cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Walks up from a directory to the nearest project root.
///
/// Every directory visited is memoized, so repeated lookups from the same
/// subtree do not touch the filesystem again. The memo belongs to the
/// locator instance; there is no process-wide cache.
#[derive(Debug, Default)]
pub struct ProjectLocator {
    cache: HashMap<PathBuf, Option<PathBuf>>,
}

impl ProjectLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nearest ancestor of `start` (inclusive) containing a project marker.
    pub fn locate(&mut self, start: &Path) -> Option<PathBuf> {
        let mut visited = Vec::new();
        let mut current = Some(start);
        let mut found = None;

        while let Some(dir) = current {
            if let Some(cached) = self.cache.get(dir) {
                found.clone_from(cached);
                break;
            }
            visited.push(dir.to_path_buf());
            if PROJECT_MARKERS.iter().any(|m| dir.join(m).exists()) {
                found = Some(dir.to_path_buf());
                break;
            }
            current = dir.parent();
        }

        for dir in visited {
            self.cache.insert(dir, found.clone());
        }
        found
    }

    /// Number of memoized directories.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

/// Per-user settings directory (`~/.config/stowage` on Linux).
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("STOWAGE_HOME") {
        return Some(PathBuf::from(val));
    }
    dirs::config_dir().map(|d| d.join("stowage"))
}

/// Default filesystem store when none is configured.
pub fn default_store_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("stowage").join("store"))
}
