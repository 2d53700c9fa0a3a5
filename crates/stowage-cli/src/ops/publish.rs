//! Publish orchestrator.
//!
//! `VALIDATE → (per component: CHECK-EXISTS → UPLOAD-ARCHIVE →
//! UPLOAD-MANIFEST → REGISTER) → BUILD-RELEASE → UPLOAD-RELEASE`
//!
//! In atomic mode every key uploaded by this invocation is deleted again
//! when any component fails, so the store never holds part of a batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use stowage_core::lock::write_atomic;
use stowage_core::manifest::{load_manifest, verify_archive};
use stowage_core::reporter::transfer_progress;
use stowage_core::storage::StorageError;
use stowage_schema::{Component, ComponentRef, Manifest, ReleaseManifest, ReleaseVersion, layout};

use super::{Context, OpError};

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub components: Vec<Component>,
    pub release: Option<ReleaseVersion>,
    pub release_name: Option<String>,
    pub force: bool,
    pub atomic: bool,
}

impl PublishRequest {
    pub fn new(components: Vec<Component>) -> Self {
        Self {
            components,
            release: None,
            release_name: None,
            force: false,
            atomic: true,
        }
    }

    pub fn release(mut self, version: ReleaseVersion) -> Self {
        self.release = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentStatus {
    Published { bytes: u64 },
    AlreadyPublished,
    Failed { error: String },
    /// Published, then removed again because the batch failed.
    RolledBack,
}

impl ComponentStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Published { .. } | Self::AlreadyPublished)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentOutcome {
    pub component: Component,
    #[serde(flatten)]
    pub status: ComponentStatus,
    /// Storage key of the component manifest.
    pub manifest_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub release_version: Option<ReleaseVersion>,
    pub release_manifest: Option<ReleaseManifest>,
    pub components: Vec<ComponentOutcome>,
    pub bytes_transferred: u64,
    pub error: Option<String>,
    pub duration: Duration,
    /// First failure, kept for exit-code projection.
    #[serde(skip)]
    pub failure: Option<OpError>,
}

impl PublishResult {
    pub fn succeeded(&self) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|o| o.status.is_success())
            .map(|o| &o.component)
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.failure, self.success) {
            (_, true) => super::exit::SUCCESS,
            (Some(err), false) => err.exit_code(),
            (None, false) => super::exit::GENERAL,
        }
    }
}

/// A component whose local manifest was found during validation.
struct Staged {
    component: Component,
    manifest: Manifest,
    manifest_path: PathBuf,
}

/// Keys written by this invocation, in upload order.
#[derive(Default)]
struct Uploads {
    keys: Vec<String>,
}

/// Publish `req.components` and optionally a release referencing them.
///
/// Errors that make the request unviable (a missing manifest in atomic
/// mode, a release collision without `force`) return `Err` before any
/// transfer. Failures during transfer are reported in the result.
pub async fn publish(ctx: &Context, req: PublishRequest) -> Result<PublishResult, OpError> {
    let start = Instant::now();
    if req.components.is_empty() {
        return Err(OpError::Validation("no components to publish".into()));
    }

    // VALIDATE
    let engine = ctx.manifests();
    let mut staged = Vec::new();
    let mut outcomes = Vec::new();
    let mut first_failure: Option<OpError> = None;

    for component in &req.components {
        let found = engine
            .find_manifest(component)
            .ok_or_else(|| OpError::ComponentNotFound(component.to_string()))
            .and_then(|path| Ok((load_manifest(&path)?, path)));
        match found {
            Ok((manifest, manifest_path)) => staged.push(Staged {
                component: component.clone(),
                manifest,
                manifest_path,
            }),
            Err(err) if req.atomic => return Err(err),
            Err(err) => {
                tracing::warn!(%component, "skipping component: {err}");
                ctx.reporter.failed(component, &err.to_string());
                outcomes.push(ComponentOutcome {
                    component: component.clone(),
                    status: ComponentStatus::Failed {
                        error: err.to_string(),
                    },
                    manifest_key: None,
                });
                first_failure.get_or_insert(err);
            }
        }
    }

    if let Some(version) = &req.release {
        check_release_free(ctx, version, req.force).await?;
    }

    ctx.reporter.section("Publishing");
    let mut uploads = Uploads::default();
    let mut bytes_transferred = 0;

    for item in &staged {
        let mut own = Uploads::default();
        let result = publish_one(ctx, item, req.force, &mut own).await;
        let manifest_key = Some(layout::manifest_key(&item.component));
        match result {
            Ok(status) => {
                if let ComponentStatus::Published { bytes } = &status {
                    bytes_transferred += bytes;
                }
                uploads.keys.append(&mut own.keys);
                outcomes.push(ComponentOutcome {
                    component: item.component.clone(),
                    status,
                    manifest_key,
                });
            }
            Err(err) => {
                ctx.reporter.failed(&item.component, &err.to_string());
                tracing::warn!(component = %item.component, "publish failed: {err}");
                // Never leave a half-published component behind.
                delete_keys(ctx, &own.keys).await;
                outcomes.push(ComponentOutcome {
                    component: item.component.clone(),
                    status: ComponentStatus::Failed {
                        error: err.to_string(),
                    },
                    manifest_key,
                });
                let cancelled = err.is_cancelled();
                first_failure.get_or_insert(err);
                if req.atomic || cancelled {
                    break;
                }
            }
        }
    }

    let mut release_manifest = None;
    if first_failure.is_none()
        && let Some(version) = &req.release
    {
        match publish_release(ctx, version, req.release_name.clone(), &outcomes).await {
            Ok(release) => release_manifest = Some(release),
            Err(err) => {
                ctx.reporter.error(&format!("release {version} not published: {err}"));
                first_failure = Some(err);
            }
        }
    }

    if first_failure.is_some() && req.atomic && !uploads.keys.is_empty() {
        ctx.reporter
            .warning("rolling back components published in this run");
        delete_keys(ctx, &uploads.keys).await;
        for outcome in &mut outcomes {
            if matches!(outcome.status, ComponentStatus::Published { .. }) {
                outcome.status = ComponentStatus::RolledBack;
            }
        }
    }

    if first_failure.is_none() {
        let count = outcomes.len();
        ctx.reporter
            .summary(count, "published", start.elapsed().as_secs_f64());
    } else if req.release.is_some() {
        ctx.reporter
            .warning("release manifest not published because a component failed");
    }

    Ok(PublishResult {
        success: first_failure.is_none(),
        release_version: req.release,
        release_manifest,
        components: outcomes,
        bytes_transferred,
        error: first_failure.as_ref().map(ToString::to_string),
        duration: start.elapsed(),
        failure: first_failure,
    })
}

async fn check_release_free(
    ctx: &Context,
    version: &ReleaseVersion,
    force: bool,
) -> Result<(), OpError> {
    if force {
        return Ok(());
    }
    let local = ctx.paths.release_path(version);
    if local.exists() {
        return Err(OpError::FileExists(format!(
            "release {version} ({})",
            local.display()
        )));
    }
    if ctx.storage.exists(&layout::release_key(version)).await? {
        return Err(OpError::FileExists(format!(
            "release {version} in {}",
            ctx.storage.location()
        )));
    }
    Ok(())
}

/// Where the packed archive for `manifest` lives locally.
fn local_archive(ctx: &Context, manifest: &Manifest) -> PathBuf {
    if let Some(location) = &manifest.archive.location {
        let candidate = ctx.paths.root.join(location);
        if candidate.is_file() {
            return candidate;
        }
    }
    ctx.paths.archive_path(&manifest.archive.filename)
}

async fn publish_one(
    ctx: &Context,
    item: &Staged,
    force: bool,
    uploads: &mut Uploads,
) -> Result<ComponentStatus, OpError> {
    ctx.cancel.checkpoint()?;
    let component = &item.component;
    let archive_key = layout::archive_key(component, &item.manifest.archive.filename);
    let manifest_key = layout::manifest_key(component);

    // CHECK-EXISTS
    if !force
        && ctx.storage.exists(&archive_key).await?
        && ctx.storage.exists(&manifest_key).await?
    {
        tracing::debug!(%component, "already published");
        ctx.reporter.done(component, "already published", None);
        ctx.registry()?.register(&item.manifest, &item.manifest_path)?;
        return Ok(ComponentStatus::AlreadyPublished);
    }

    let archive = local_archive(ctx, &item.manifest);
    if !archive.is_file() {
        return Err(OpError::ComponentNotFound(format!(
            "{component}: archive {} is missing",
            archive.display()
        )));
    }
    verify_archive(&item.manifest, &archive).await?;

    // UPLOAD-ARCHIVE
    let progress = transfer_progress(Arc::clone(&ctx.reporter), component.clone());
    let mut bytes = upload_tracked(ctx, &archive, &archive_key, Some(progress), uploads).await?;

    // UPLOAD-MANIFEST, pointing at the archive's storage key
    let mut remote = item.manifest.clone();
    remote.archive.location = Some(archive_key);
    let staging = tempfile::Builder::new()
        .prefix(".stowage-manifest-")
        .suffix(".json")
        .tempfile()?;
    write_json(staging.path(), &remote)?;
    bytes += upload_tracked(ctx, staging.path(), &manifest_key, None, uploads).await?;

    // REGISTER
    ctx.registry()?.register(&item.manifest, &item.manifest_path)?;
    ctx.reporter.done(component, "published", Some(bytes));
    tracing::info!(%component, bytes, "component published");
    Ok(ComponentStatus::Published { bytes })
}

async fn upload_tracked(
    ctx: &Context,
    local: &Path,
    key: &str,
    progress: Option<stowage_core::ProgressFn>,
    uploads: &mut Uploads,
) -> Result<u64, OpError> {
    let bytes = ctx.storage.upload(local, key, progress).await?;
    uploads.keys.push(key.to_string());
    Ok(bytes)
}

async fn publish_release(
    ctx: &Context,
    version: &ReleaseVersion,
    name: Option<String>,
    outcomes: &[ComponentOutcome],
) -> Result<ReleaseManifest, OpError> {
    let mut release = ReleaseManifest::new(version.clone(), name);
    for outcome in outcomes {
        release.components.push(ComponentRef {
            kind: outcome.component.kind.clone(),
            version: outcome.component.version.clone(),
            manifest: layout::manifest_key(&outcome.component),
        });
    }

    let local = ctx.paths.release_path(version);
    let previous = std::fs::read(&local).ok();
    write_json(&local, &release)?;
    match ctx
        .storage
        .upload(&local, &layout::release_key(version), None)
        .await
    {
        Ok(_) => {
            ctx.reporter.info(&format!("release {version} published"));
            tracing::info!(%version, components = release.components.len(), "release published");
            Ok(release)
        }
        Err(err) => {
            // Only undo what this call wrote.
            let restored = match &previous {
                Some(bytes) => write_atomic(&local, bytes),
                None => std::fs::remove_file(&local),
            };
            if let Err(e) = restored {
                tracing::warn!(path = %local.display(), "could not restore local release file: {e}");
            }
            Err(err.into())
        }
    }
}

async fn delete_keys(ctx: &Context, keys: &[String]) {
    for key in keys.iter().rev() {
        match ctx.storage.delete(key).await {
            Ok(()) => tracing::debug!(key, "rolled back upload"),
            Err(StorageError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(key, "rollback delete failed: {err}");
                ctx.reporter
                    .warning(&format!("could not remove {key} during rollback: {err}"));
            }
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OpError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| OpError::context("Failed to encode JSON", e))?;
    write_atomic(path, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::pack::{PackRequest, pack};
    use crate::ops::testing::fs_context;

    async fn packed(ctx: &Context, kind: &str, version: &str) -> Component {
        let src = ctx.paths.root.join("src").join(kind);
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("data.txt"), format!("{kind} {version}")).unwrap();
        let component = Component::new(kind, version);
        pack(ctx, PackRequest::new(&src, component.clone()))
            .await
            .unwrap();
        component
    }

    #[tokio::test]
    async fn test_publish_uploads_layout_keys() {
        let (_tmp, ctx) = fs_context();
        let model = packed(&ctx, "model", "1.0.0").await;

        let result = publish(
            &ctx,
            PublishRequest::new(vec![model]).release(ReleaseVersion::new("2024.01.20")),
        )
        .await
        .unwrap();

        assert!(result.success, "{:?}", result.error);
        let keys = ctx.storage.list("").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "model/1.0.0/model-1.0.0.manifest.json",
                "model/1.0.0/model-1.0.0.tar.gz",
                "releases/2024.01.20.release.json",
            ]
        );
        let release = result.release_manifest.unwrap();
        assert_eq!(
            release.components[0].manifest,
            "model/1.0.0/model-1.0.0.manifest.json"
        );
        assert!(ctx.paths.release_path(&ReleaseVersion::new("2024.01.20")).is_file());
    }

    #[tokio::test]
    async fn test_release_collision_needs_force() {
        let (_tmp, ctx) = fs_context();
        let model = packed(&ctx, "model", "1.0.0").await;
        let req = PublishRequest::new(vec![model]).release(ReleaseVersion::new("1.0.0"));

        publish(&ctx, req.clone()).await.unwrap();
        assert!(matches!(
            publish(&ctx, req.clone()).await,
            Err(OpError::FileExists(_))
        ));

        let forced = PublishRequest { force: true, ..req };
        assert!(publish(&ctx, forced).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_failed_release_upload_keeps_existing_local_release() {
        let (tmp, ctx) = fs_context();
        let model = packed(&ctx, "model", "1.0.0").await;
        let version = ReleaseVersion::new("2024.01.20");
        let local = ctx.paths.release_path(&version);
        write_atomic(&local, b"previous").unwrap();
        // A file where the releases directory should be makes the upload fail.
        std::fs::create_dir_all(tmp.path().join("store")).unwrap();
        std::fs::write(tmp.path().join("store").join("releases"), b"").unwrap();

        let req = PublishRequest {
            force: true,
            ..PublishRequest::new(vec![model]).release(version)
        };
        let result = publish(&ctx, req).await.unwrap();

        assert!(!result.success);
        assert!(result.release_manifest.is_none());
        assert_eq!(std::fs::read(&local).unwrap(), b"previous");
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_fast_in_atomic_mode() {
        let (_tmp, ctx) = fs_context();
        let model = packed(&ctx, "model", "1.0.0").await;
        let ghost = Component::new("ghost", "0.1.0");

        let err = publish(&ctx, PublishRequest::new(vec![model, ghost]))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::ComponentNotFound(_)));
        assert!(ctx.storage.list("").await.unwrap().is_empty());
    }
}
