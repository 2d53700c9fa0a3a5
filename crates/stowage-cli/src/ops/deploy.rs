//! Deploy orchestrator.
//!
//! `RESOLVE-RELEASE → PREPARE-TARGET → (per component: RESOLVE-MANIFEST →
//! FETCH-ARCHIVE → VERIFY-CHECKSUM → EXTRACT) → UPDATE-SYMLINKS →
//! PERSIST-STATE → VERIFY`
//!
//! Components are extracted into immutable version-qualified directories
//! and published by switching a stable link. Every change made after the
//! target is prepared is journaled so a failed or cancelled deploy can be
//! undone without touching what was deployed before it.

use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use stowage_core::archive::{ArchiveOptions, Archiver, Source};
use stowage_core::checksum::sha256_file_async;
use stowage_core::lock::write_atomic;
use stowage_core::manifest::load_manifest;
use stowage_core::reporter::{archive_progress, transfer_progress};
use stowage_core::storage::StorageError;
use stowage_schema::{
    Component, DeploymentState, FileRecord, Manifest, ReleaseManifest, ReleaseVersion, layout,
};

use super::target::{
    COMPONENT_MANIFEST, DeployTarget, PARTIAL_SUFFIX, RELEASES_DIR, VerifyReport, read_link,
    switch_symlink, verify_tree,
};
use super::{Context, OpError};

#[derive(Debug, Clone)]
pub enum DeploySubject {
    Release(ReleaseVersion),
    Component(Component),
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub subject: DeploySubject,
    pub target: PathBuf,
    pub verify: bool,
    pub verify_checksums: bool,
    pub rollback: bool,
}

impl DeployRequest {
    pub fn release(version: ReleaseVersion, target: impl Into<PathBuf>) -> Self {
        Self::new(DeploySubject::Release(version), target.into())
    }

    pub fn component(component: Component, target: impl Into<PathBuf>) -> Self {
        Self::new(DeploySubject::Component(component), target.into())
    }

    fn new(subject: DeploySubject, target: PathBuf) -> Self {
        Self {
            subject,
            target,
            verify: true,
            verify_checksums: false,
            rollback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployedComponent {
    pub component: Component,
    /// Extracted directory, relative to the target.
    pub path: String,
    /// Link name, relative to the target.
    pub link: String,
    /// Already extracted by an earlier deploy.
    pub reused: bool,
}

#[derive(Debug, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub release_version: Option<ReleaseVersion>,
    pub target: PathBuf,
    pub components: Vec<DeployedComponent>,
    pub state: Option<DeploymentState>,
    pub verification: Option<VerifyReport>,
    pub rolled_back: bool,
    pub error: Option<String>,
    pub duration: Duration,
    #[serde(skip)]
    pub failure: Option<OpError>,
}

impl DeployResult {
    pub fn exit_code(&self) -> i32 {
        match (&self.failure, self.success) {
            (_, true) => super::exit::SUCCESS,
            (Some(err), false) => err.exit_code(),
            (None, false) => super::exit::GENERAL,
        }
    }
}

/// Where one component goes on the target.
#[derive(Debug, Clone)]
struct Placement {
    component: Component,
    manifest_key: String,
    /// Extraction directory relative to the target.
    rel_dir: PathBuf,
    /// Link path relative to the target.
    link: PathBuf,
    /// What the link points at, relative to the link's directory.
    link_to: PathBuf,
}

impl Placement {
    /// `{target}/{type}` → `releases/{release}/{type}/{version}`
    fn for_release(release: &ReleaseVersion, component: Component, manifest_key: String) -> Self {
        let rel_dir = Path::new(RELEASES_DIR)
            .join(release)
            .join(&component.kind)
            .join(&component.version);
        Self {
            link: PathBuf::from(component.kind.as_str()),
            link_to: rel_dir.clone(),
            rel_dir,
            manifest_key,
            component,
        }
    }

    /// `{target}/{type}/current` → `{version}`
    fn standalone(component: Component) -> Self {
        let rel_dir = Path::new(component.kind.as_str()).join(&component.version);
        Self {
            link: Path::new(component.kind.as_str()).join("current"),
            link_to: PathBuf::from(component.version.as_str()),
            manifest_key: layout::manifest_key(&component),
            rel_dir,
            component,
        }
    }

    fn link_name(&self) -> String {
        slash_path(&self.link)
    }

    /// Both the extraction directory and the link stay below the target.
    fn check_contained(&self) -> Result<(), OpError> {
        for path in [&self.rel_dir, &self.link] {
            if !path
                .components()
                .all(|c| matches!(c, PathComponent::Normal(_)))
            {
                return Err(OpError::Validation(format!(
                    "{} would be placed outside the target at {}",
                    self.component,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Changes made by one deploy, undone in reverse on failure.
#[derive(Debug, Default)]
struct Journal {
    created_dirs: Vec<PathBuf>,
    /// Link and the target it had before this deploy.
    links: Vec<(PathBuf, Option<PathBuf>)>,
    state_before: Option<Vec<u8>>,
    state_written: bool,
}

/// One component fetched, verified and extracted.
struct Extracted {
    deployed: DeployedComponent,
    manifest: Manifest,
    archive: Option<PathBuf>,
}

/// Deploy a release or a single component to `req.target`.
///
/// A release that cannot be resolved is an `Err` and leaves the target
/// untouched. Failures after the target is prepared are reported in the
/// result, after rolling back when `req.rollback` is set.
pub async fn deploy(ctx: &Context, req: DeployRequest) -> Result<DeployResult, OpError> {
    let start = Instant::now();
    let target = DeployTarget::new(&req.target);

    // RESOLVE-RELEASE
    let (release, placements) = match &req.subject {
        DeploySubject::Release(version) => {
            let manifest = resolve_release(ctx, &target, version).await?;
            if manifest.components.is_empty() {
                return Err(OpError::Validation(format!("release {version} has no components")));
            }
            let placements = manifest
                .components
                .iter()
                .map(|c| Placement::for_release(version, c.component(), c.manifest.clone()))
                .collect::<Vec<_>>();
            (Some((version.clone(), manifest)), placements)
        }
        DeploySubject::Component(component) => (None, vec![Placement::standalone(component.clone())]),
    };
    for placement in &placements {
        placement.check_contained()?;
    }

    // PREPARE-TARGET
    std::fs::create_dir_all(target.root())?;
    let _lock = target.lock().await?;
    for p in &placements {
        match &req.subject {
            DeploySubject::Release(_) => target.ensure_linkable(&target.root().join(&p.link))?,
            DeploySubject::Component(c) => {
                let type_dir = target.root().join(c.kind.as_str());
                if read_link(&type_dir).is_some() {
                    return Err(OpError::Validation(format!(
                        "{} is a release link; deploy component {c} to another target",
                        type_dir.display()
                    )));
                }
            }
        }
    }
    let previous = target.load_state()?;
    if let Some((version, manifest)) = &release {
        cache_release(&target, version, manifest)?;
    }

    let label = match &req.subject {
        DeploySubject::Release(v) => format!("release {v}"),
        DeploySubject::Component(c) => c.to_string(),
    };
    ctx.reporter
        .section(&format!("Deploying {label} to {}", target.root().display()));
    tracing::info!(subject = %label, target = %target.root().display(), "deploy started");

    let mut run = Run {
        ctx,
        target: &target,
        req: &req,
        journal: Journal {
            state_before: std::fs::read(target.state_path()).ok(),
            ..Journal::default()
        },
        extracted: Vec::new(),
        verification: None,
    };

    let release_version = release.map(|(v, _)| v);
    let outcome = run
        .execute(&placements, release_version.as_ref(), previous)
        .await;

    let (state, failure, rolled_back) = match outcome {
        Ok(state) => (Some(state), None, false),
        Err(err) => {
            ctx.reporter.error(&format!("deploy of {label} failed: {err}"));
            if req.rollback {
                run.rollback();
            }
            (None, Some(err), req.rollback)
        }
    };

    if failure.is_none() {
        ctx.reporter
            .summary(run.extracted.len(), "deployed", start.elapsed().as_secs_f64());
    }

    Ok(DeployResult {
        success: failure.is_none(),
        release_version,
        target: req.target.clone(),
        components: run.extracted.into_iter().map(|e| e.deployed).collect(),
        state,
        verification: run.verification,
        rolled_back,
        error: failure.as_ref().map(ToString::to_string),
        duration: start.elapsed(),
        failure,
    })
}

/// Local release manifest first (project, then target cache), then storage.
async fn resolve_release(
    ctx: &Context,
    target: &DeployTarget,
    version: &ReleaseVersion,
) -> Result<ReleaseManifest, OpError> {
    let filename = layout::release_filename(version);
    for candidate in [
        ctx.paths.release_path(version),
        target.manifest_cache().join(RELEASES_DIR).join(&filename),
    ] {
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using local release manifest");
            return read_release(&candidate);
        }
    }

    let key = layout::release_key(version);
    if !ctx.storage.exists(&key).await? {
        return Err(OpError::ReleaseNotFound(format!(
            "{version} (not local, not in {})",
            ctx.storage.location()
        )));
    }
    let staging = tempfile::Builder::new()
        .prefix(".stowage-release-")
        .suffix(".json")
        .tempfile()?;
    ctx.storage.download(&key, staging.path(), None).await?;
    read_release(staging.path())
}

fn read_release(path: &Path) -> Result<ReleaseManifest, OpError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        OpError::Validation(format!("malformed release manifest {}: {e}", path.display()))
    })
}

fn cache_release(
    target: &DeployTarget,
    version: &ReleaseVersion,
    manifest: &ReleaseManifest,
) -> Result<(), OpError> {
    let path = target
        .manifest_cache()
        .join(RELEASES_DIR)
        .join(layout::release_filename(version));
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| OpError::context("Failed to encode release manifest", e))?;
    write_atomic(&path, &json)?;
    Ok(())
}

struct Run<'a> {
    ctx: &'a Context,
    target: &'a DeployTarget,
    req: &'a DeployRequest,
    journal: Journal,
    extracted: Vec<Extracted>,
    verification: Option<VerifyReport>,
}

impl Run<'_> {
    async fn execute(
        &mut self,
        placements: &[Placement],
        release: Option<&ReleaseVersion>,
        previous: Option<DeploymentState>,
    ) -> Result<DeploymentState, OpError> {
        for placement in placements {
            let extracted = self.deploy_component(placement).await?;
            self.extracted.push(extracted);
        }

        // UPDATE-SYMLINKS
        self.ctx.cancel.checkpoint()?;
        for placement in placements {
            self.link(placement)?;
        }

        // PERSIST-STATE
        let mut state = previous.unwrap_or_default();
        if let Some(release) = release {
            let prior = state.release_version.replace(release.to_string());
            if let Some(prior) = prior
                && prior != release.as_str()
            {
                state.previous_version = Some(prior);
            }
        }
        for placement in placements {
            let kind = placement.component.kind.to_string();
            state
                .components
                .insert(kind.clone(), placement.component.version.to_string());
            state
                .symlinks
                .insert(placement.link_name(), slash_path(&placement.link_to));
            state.paths.insert(kind, slash_path(&placement.rel_dir));
        }
        state.deployed_at = Utc::now();
        self.target.save_state(&state)?;
        self.journal.state_written = true;

        // VERIFY
        if self.req.verify {
            self.verify().await?;
        }

        tracing::info!(target = %self.target.root().display(), "deploy complete");
        Ok(state)
    }

    async fn deploy_component(&mut self, placement: &Placement) -> Result<Extracted, OpError> {
        let ctx = self.ctx;
        ctx.cancel.checkpoint()?;
        let component = &placement.component;
        let dir = self.target.root().join(&placement.rel_dir);

        // RESOLVE-MANIFEST
        let manifest = self.fetch_manifest(placement).await?;
        let expected = manifest.archive.checksum.sha256.clone().ok_or_else(|| {
            OpError::Validation(format!("manifest for {component} has no sha256 checksum"))
        })?;

        let deployed = DeployedComponent {
            component: component.clone(),
            path: slash_path(&placement.rel_dir),
            link: placement.link_name(),
            reused: false,
        };

        if dir.exists() {
            let existing = load_manifest(&dir.join(COMPONENT_MANIFEST)).ok();
            if existing.and_then(|m| m.archive.checksum.sha256).as_ref() == Some(&expected) {
                tracing::debug!(%component, dir = %dir.display(), "already extracted");
                ctx.reporter.done(component, "already extracted", None);
                return Ok(Extracted {
                    deployed: DeployedComponent {
                        reused: true,
                        ..deployed
                    },
                    manifest,
                    archive: None,
                });
            }
            return Err(OpError::Validation(format!(
                "{} already exists with different content",
                dir.display()
            )));
        }

        // FETCH-ARCHIVE
        let filename = &manifest.archive.filename;
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            return Err(OpError::Validation(format!(
                "manifest for {component} has an invalid archive filename '{filename}'"
            )));
        }
        let archive = self.target.archive_cache().join(filename);
        let cached = archive.is_file() && sha256_file_async(archive.clone()).await? == expected;
        if cached {
            tracing::debug!(%component, "using cached archive");
        } else {
            let key = layout::archive_key(component, filename);
            let progress = transfer_progress(Arc::clone(&ctx.reporter), component.clone());
            ctx.storage
                .download(&key, &archive, Some(progress))
                .await
                .map_err(|e| not_found_as_component(e, component))?;
        }

        // VERIFY-CHECKSUM, strictly before anything is extracted
        let actual = sha256_file_async(archive.clone()).await?;
        if actual != expected {
            let _ = std::fs::remove_file(&archive);
            return Err(OpError::ChecksumMismatch {
                filename: filename.clone(),
                expected,
                actual,
            });
        }

        // EXTRACT into a sibling, then rename into place
        if let Some(parent) = dir.parent() {
            self.create_dirs(parent)?;
        }
        let partial = with_suffix(&dir, PARTIAL_SUFFIX);
        if partial.exists() {
            std::fs::remove_dir_all(&partial)?;
        }
        let archiver = Archiver::new(ArchiveOptions::default())
            .with_cancel(ctx.cancel.clone())
            .with_progress(archive_progress(Arc::clone(&ctx.reporter), component.clone()));
        let extracted = archiver
            .decompress(Source::File(archive.clone()), &partial, None)
            .await;
        let stats = match extracted {
            Ok(stats) => stats,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&partial);
                return Err(err.into());
            }
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| OpError::context("Failed to encode manifest", e))?;
        std::fs::write(partial.join(COMPONENT_MANIFEST), json)?;
        std::fs::rename(&partial, &dir)?;
        self.journal.created_dirs.push(dir.clone());

        ctx.reporter.done(
            component,
            &format!("{} files extracted", stats.files),
            Some(stats.bytes),
        );
        tracing::info!(%component, dir = %dir.display(), files = stats.files, "component extracted");

        Ok(Extracted {
            deployed,
            manifest,
            archive: Some(archive),
        })
    }

    async fn fetch_manifest(&self, placement: &Placement) -> Result<Manifest, OpError> {
        let component = &placement.component;
        let name = placement
            .manifest_key
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty() && !n.starts_with('.') && !n.contains('\\'))
            .map_or_else(|| layout::manifest_filename(component), str::to_string);
        let cached = self.target.manifest_cache().join(name);
        if let Some(parent) = cached.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.ctx
            .storage
            .download(&placement.manifest_key, &cached, None)
            .await
            .map_err(|e| not_found_as_component(e, component))?;

        let manifest = load_manifest(&cached)?;
        if manifest.component() != *component {
            return Err(OpError::Validation(format!(
                "{} describes {}, expected {component}",
                placement.manifest_key,
                manifest.component()
            )));
        }
        Ok(manifest)
    }

    /// `create_dir_all`, journaling the outermost directory it created.
    fn create_dirs(&mut self, dir: &Path) -> Result<(), OpError> {
        let mut first_missing = None;
        let mut cursor = Some(dir);
        while let Some(d) = cursor {
            if d.exists() {
                break;
            }
            first_missing = Some(d.to_path_buf());
            cursor = d.parent();
        }
        std::fs::create_dir_all(dir)?;
        if let Some(created) = first_missing {
            self.journal.created_dirs.push(created);
        }
        Ok(())
    }

    fn link(&mut self, placement: &Placement) -> Result<(), OpError> {
        let link = self.target.root().join(&placement.link);
        let before = read_link(&link);
        if before.as_deref() == Some(placement.link_to.as_path()) {
            return Ok(());
        }
        switch_symlink(&link, &placement.link_to)?;
        self.journal.links.push((link, before));
        Ok(())
    }

    async fn verify(&mut self) -> Result<(), OpError> {
        let mut report = VerifyReport::default();
        for item in &self.extracted {
            let files = expected_files(&item.manifest, item.archive.as_deref()).await?;
            let dir = self.target.root().join(&item.deployed.path);
            let part = verify_tree(
                &dir,
                &files,
                self.req.verify_checksums,
                &item.deployed.component.to_string(),
            )
            .await?;
            report.merge(part);
        }

        let ok = report.is_ok();
        let summary = report.summary();
        self.verification = Some(report);
        if ok {
            self.ctx.reporter.info(&format!("verified: {summary}"));
            Ok(())
        } else {
            Err(OpError::Verification(summary))
        }
    }

    /// Undo this run's changes. Failures are reported, never raised, so
    /// they cannot mask the error that triggered the rollback.
    fn rollback(&self) {
        let reporter = &self.ctx.reporter;
        reporter.warning("rolling back this deploy");
        let mut clean = true;
        let mut warn = |what: String| {
            tracing::warn!("{what}");
            reporter.warning(&what);
            clean = false;
        };

        for (link, before) in self.journal.links.iter().rev() {
            let restored = match before {
                Some(previous) => switch_symlink(link, previous),
                None => std::fs::remove_file(link),
            };
            if let Err(e) = restored {
                warn(format!("could not restore {}: {e}", link.display()));
            }
        }

        for dir in self.journal.created_dirs.iter().rev() {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => tracing::debug!(dir = %dir.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn(format!("could not remove {}: {e}", dir.display())),
            }
        }

        if self.journal.state_written {
            let state_path = self.target.state_path();
            let restored = match &self.journal.state_before {
                Some(bytes) => write_atomic(&state_path, bytes),
                None => std::fs::remove_file(&state_path),
            };
            if let Err(e) = restored {
                warn(format!("could not restore deployment state: {e}"));
            }
        }

        tracing::info!(clean, "rollback finished");
    }
}

/// Files a deployed component must contain: the manifest's file list, or
/// the archive's listing when the manifest has none.
pub(super) async fn expected_files(
    manifest: &Manifest,
    archive: Option<&Path>,
) -> Result<Vec<FileRecord>, OpError> {
    if !manifest.archive.files.is_empty() {
        return Ok(manifest.archive.files.clone());
    }
    let Some(archive) = archive else {
        return Ok(Vec::new());
    };
    let entries = Archiver::default()
        .list_contents(Source::File(archive.to_path_buf()), None)
        .await?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| FileRecord {
            path: e.name,
            size: e.size,
            sha256: None,
        })
        .collect())
}

fn not_found_as_component(err: StorageError, component: &Component) -> OpError {
    match err {
        StorageError::NotFound(key) => {
            OpError::ComponentNotFound(format!("{component} ({key} is not in storage)"))
        }
        other => other.into(),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
