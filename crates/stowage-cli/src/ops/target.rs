//! Deploy target layout, state persistence and link switching.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use stowage_core::checksum::sha256_file_async;
use stowage_core::lock::{FileLock, write_atomic};
use stowage_schema::{DeploymentState, FileRecord, ReleaseVersion};

use super::OpError;

pub const STATE_FILE: &str = ".stowage-deploy.json";
pub const LOCK_FILE: &str = ".stowage-deploy.lock";
pub const MANIFEST_CACHE: &str = ".manifests";
pub const ARCHIVE_CACHE: &str = ".archives";
pub const RELEASES_DIR: &str = "releases";
/// Copy of the component manifest kept in every extracted directory.
pub const COMPONENT_MANIFEST: &str = ".manifest.json";
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A directory that components are deployed into.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    root: PathBuf,
}

impl DeployTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn manifest_cache(&self) -> PathBuf {
        self.root.join(MANIFEST_CACHE)
    }

    pub fn archive_cache(&self) -> PathBuf {
        self.root.join(ARCHIVE_CACHE)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn release_dir(&self, release: &ReleaseVersion) -> PathBuf {
        self.releases_dir().join(release)
    }

    /// Exclusive lock over this target's links and state.
    pub async fn lock(&self) -> Result<FileLock, OpError> {
        Ok(FileLock::acquire_async(self.root.join(LOCK_FILE)).await?)
    }

    pub fn load_state(&self) -> Result<Option<DeploymentState>, OpError> {
        let path = self.state_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| OpError::context("Malformed deployment state", e))
    }

    pub fn save_state(&self, state: &DeploymentState) -> Result<(), OpError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| OpError::context("Failed to encode deployment state", e))?;
        write_atomic(&self.state_path(), &json)?;
        tracing::debug!(target = %self.root.display(), "deployment state saved");
        Ok(())
    }

    /// Refuse to replace a real directory or file with a link.
    pub fn ensure_linkable(&self, link: &Path) -> Result<(), OpError> {
        match std::fs::symlink_metadata(link) {
            Ok(meta) if !meta.file_type().is_symlink() => Err(OpError::Validation(format!(
                "{} exists and is not a symlink",
                link.display()
            ))),
            _ => Ok(()),
        }
    }
}

/// Current target of `link`, if it is a symlink.
pub fn read_link(link: &Path) -> Option<PathBuf> {
    std::fs::read_link(link).ok()
}

/// Point `link` at `target` without a window where `link` is missing.
///
/// A new link is created under a temporary sibling name and renamed over
/// the old one.
pub fn switch_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let parent = link
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = link
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "link has no file name"))?;
    let tmp = parent.join(format!(
        ".{}.{:08x}.tmp",
        name.to_string_lossy(),
        rand::random::<u32>()
    ));

    make_symlink(target, &tmp)?;
    if let Err(e) = std::fs::rename(&tmp, link) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    tracing::debug!(link = %link.display(), target = %target.display(), "link switched");
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Result of checking deployed files against their manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub files_expected: usize,
    pub files_found: usize,
    pub missing: Vec<String>,
    pub corrupt: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }

    pub fn merge(&mut self, other: Self) {
        self.files_expected += other.files_expected;
        self.files_found += other.files_found;
        self.missing.extend(other.missing);
        self.corrupt.extend(other.corrupt);
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} files present, {} missing, {} corrupt",
            self.files_found,
            self.files_expected,
            self.missing.len(),
            self.corrupt.len()
        )
    }
}

/// Check that every recorded file exists under `dir`.
///
/// With `checksums`, files carrying a recorded SHA-256 are also re-hashed.
/// Report entries are prefixed with `label`.
pub async fn verify_tree(
    dir: &Path,
    files: &[FileRecord],
    checksums: bool,
    label: &str,
) -> Result<VerifyReport, OpError> {
    let mut report = VerifyReport {
        files_expected: files.len(),
        ..VerifyReport::default()
    };

    for record in files {
        let path = dir.join(&record.path);
        let name = format!("{label}/{}", record.path);
        if std::fs::symlink_metadata(&path).is_err() {
            report.missing.push(name);
            continue;
        }
        report.files_found += 1;

        if checksums && let Some(expected) = &record.sha256 {
            let actual = sha256_file_async(path).await?;
            if actual != *expected {
                report.corrupt.push(name);
            }
        }
    }

    if !report.is_ok() {
        tracing::warn!(dir = %dir.display(), "{}", report.summary());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::checksum::sha256_file;

    #[test]
    fn test_switch_replaces_existing_link() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("v1")).unwrap();
        std::fs::create_dir_all(tmp.path().join("v2")).unwrap();
        let link = tmp.path().join("current");

        switch_symlink(&link, Path::new("v1")).unwrap();
        assert_eq!(read_link(&link).unwrap(), Path::new("v1"));

        switch_symlink(&link, Path::new("v2")).unwrap();
        assert_eq!(read_link(&link).unwrap(), Path::new("v2"));

        // No temp links left behind.
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3, "{names:?}");
    }

    #[test]
    fn test_real_directory_is_not_linkable() {
        let tmp = tempfile::tempdir().unwrap();
        let target = DeployTarget::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("model")).unwrap();
        assert!(target.ensure_linkable(&tmp.path().join("model")).is_err());
        assert!(target.ensure_linkable(&tmp.path().join("absent")).is_ok());
    }

    #[test]
    fn test_state_round_trips_and_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let target = DeployTarget::new(tmp.path());
        assert!(target.load_state().unwrap().is_none());

        let mut state = DeploymentState::new();
        state.release_version = Some("2024.01.20".into());
        state.components.insert("model".into(), "1.0.0".into());
        target.save_state(&state).unwrap();
        assert_eq!(target.load_state().unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_verify_reports_missing_and_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"bravo").unwrap();
        let good = sha256_file(&tmp.path().join("a.txt")).unwrap();
        let records = vec![
            FileRecord {
                path: "a.txt".into(),
                size: 5,
                sha256: Some(good.clone()),
            },
            FileRecord {
                path: "b.txt".into(),
                size: 5,
                sha256: Some(good),
            },
            FileRecord {
                path: "c.txt".into(),
                size: 1,
                sha256: None,
            },
        ];

        let shallow = verify_tree(tmp.path(), &records, false, "model:1.0.0")
            .await
            .unwrap();
        assert_eq!(shallow.files_found, 2);
        assert_eq!(shallow.missing, vec!["model:1.0.0/c.txt"]);
        assert!(shallow.corrupt.is_empty());

        let deep = verify_tree(tmp.path(), &records, true, "model:1.0.0")
            .await
            .unwrap();
        assert_eq!(deep.corrupt, vec!["model:1.0.0/b.txt"]);
        assert!(!deep.is_ok());
    }
}
