//! Local-only target operations: switch, rollback, listing and re-verification.
//!
//! None of these touch storage; they work from what earlier deploys left on
//! the target.

use std::path::{Path, PathBuf};

use chrono::Utc;
use stowage_core::Reporter;
use stowage_core::manifest::load_manifest;
use stowage_schema::{DeploymentState, ReleaseVersion, Version};

use super::OpError;
use super::deploy::expected_files;
use super::target::{
    COMPONENT_MANIFEST, DeployTarget, PARTIAL_SUFFIX, RELEASES_DIR, VerifyReport, read_link,
    switch_symlink, verify_tree,
};

/// Re-point every component link at a release already extracted on `target`.
///
/// For each component type under `releases/{release}/`, the highest version
/// present is linked. Returns the updated deployment state.
pub async fn switch_version<R: Reporter + ?Sized>(
    target: &Path,
    release: &ReleaseVersion,
    reporter: &R,
) -> Result<DeploymentState, OpError> {
    let target = DeployTarget::new(target);
    let release_dir = target.release_dir(release);
    if !release_dir.is_dir() {
        return Err(OpError::ReleaseNotFound(format!(
            "{release} is not extracted at {}",
            target.root().display()
        )));
    }

    let _lock = target.lock().await?;
    let mut links = Vec::new();
    for (kind, version) in extracted_components(&release_dir)? {
        let link = target.root().join(&kind);
        target.ensure_linkable(&link)?;
        let link_to = Path::new(RELEASES_DIR)
            .join(release)
            .join(&kind)
            .join(&version);
        links.push((kind, version, link, link_to));
    }
    if links.is_empty() {
        return Err(OpError::Validation(format!(
            "{} contains no extracted components",
            release_dir.display()
        )));
    }

    for (_, _, link, link_to) in &links {
        if read_link(link).as_deref() != Some(link_to.as_path()) {
            switch_symlink(link, link_to)?;
        }
    }

    let mut state = target.load_state()?.unwrap_or_default();
    let prior = state.release_version.replace(release.to_string());
    if let Some(prior) = prior
        && prior != release.as_str()
    {
        state.previous_version = Some(prior);
    }
    for (kind, version, _, link_to) in links {
        let rel = link_to.to_string_lossy().replace('\\', "/");
        state.symlinks.insert(kind.clone(), rel.clone());
        state.paths.insert(kind.clone(), rel);
        state.components.insert(kind, version.to_string());
    }
    state.deployed_at = Utc::now();
    target.save_state(&state)?;

    reporter.info(&format!(
        "{} now serves release {release}",
        target.root().display()
    ));
    tracing::info!(target = %target.root().display(), %release, "switched release");
    Ok(state)
}

/// Switch `target` back to the release recorded as previous.
pub async fn rollback_release<R: Reporter + ?Sized>(
    target: &Path,
    reporter: &R,
) -> Result<DeploymentState, OpError> {
    let state = DeployTarget::new(target).load_state()?;
    let previous = state
        .and_then(|s| s.previous_version)
        .ok_or_else(|| {
            OpError::Validation(format!(
                "no previous release recorded at {}",
                target.display()
            ))
        })?;
    reporter.info(&format!("rolling back to release {previous}"));
    switch_version(target, &ReleaseVersion::new(previous), reporter).await
}

/// Releases extracted under `{target}/releases/`, oldest first.
pub fn list_deployed_versions(target: &Path) -> Result<Vec<String>, OpError> {
    let dir = DeployTarget::new(target).releases_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut versions: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.') && !name.ends_with(PARTIAL_SUFFIX))
        .collect();
    versions.sort_by(|a, b| Version::new(a).cmp(&Version::new(b)));
    Ok(versions)
}

/// Persisted deployment state of `target`, if anything was deployed there.
pub fn status(target: &Path) -> Result<Option<DeploymentState>, OpError> {
    DeployTarget::new(target).load_state()
}

/// Re-check every deployed component against its recorded file list.
pub async fn verify_deployment(target: &Path, checksums: bool) -> Result<VerifyReport, OpError> {
    let target = DeployTarget::new(target);
    let state = target.load_state()?.ok_or_else(|| {
        OpError::Validation(format!(
            "nothing deployed at {}",
            target.root().display()
        ))
    })?;

    let mut report = VerifyReport::default();
    for (kind, rel) in &state.paths {
        let dir = target.root().join(rel);
        let label = state
            .components
            .get(kind)
            .map_or_else(|| kind.clone(), |v| format!("{kind}:{v}"));
        if !dir.is_dir() {
            report.files_expected += 1;
            report.missing.push(rel.clone());
            continue;
        }
        let manifest_path = dir.join(COMPONENT_MANIFEST);
        let manifest = match load_manifest(&manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %manifest_path.display(), "cannot verify component: {e}");
                report.files_expected += 1;
                report.missing.push(format!("{label}/{COMPONENT_MANIFEST}"));
                continue;
            }
        };
        let archive = cached_archive(&target, &manifest.archive.filename);
        let files = expected_files(&manifest, archive.as_deref()).await?;
        if files.is_empty() && archive.is_none() {
            // Nothing to check against: neither a file list nor the archive.
            report.files_expected += 1;
            report
                .missing
                .push(format!("{label}/{}", manifest.archive.filename));
            continue;
        }
        report.merge(verify_tree(&dir, &files, checksums, &label).await?);
    }
    Ok(report)
}

/// The archive a component was extracted from, if still in the target cache.
fn cached_archive(target: &DeployTarget, filename: &str) -> Option<PathBuf> {
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
        return None;
    }
    let path = target.archive_cache().join(filename);
    path.is_file().then_some(path)
}

/// `(type, highest version)` for each component directory in a release.
fn extracted_components(release_dir: &Path) -> Result<Vec<(String, Version)>, OpError> {
    let mut found = Vec::new();
    for kind in subdirs(release_dir)? {
        let best = subdirs(&release_dir.join(&kind))?
            .into_iter()
            .map(|v| Version::new(&v))
            .max();
        if let Some(version) = best {
            found.push((kind, version));
        }
    }
    found.sort();
    Ok(found)
}

fn subdirs(dir: &Path) -> Result<Vec<String>, OpError> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.') && !name.ends_with(PARTIAL_SUFFIX))
        .collect())
}
