//! Pack a source tree into a component archive plus manifest.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use stowage_core::archive::{Compression, Destination};
use stowage_core::manifest::ManifestInput;
use stowage_schema::{Component, Manifest, layout};

use super::{Context, OpError};

#[derive(Debug, Clone)]
pub struct PackRequest {
    pub source: PathBuf,
    pub component: Component,
    /// `None` uses `[pack].compression`.
    pub compression: Option<Compression>,
    pub level: Option<u32>,
    /// Directory for the archive; defaults to the project's `dist/`.
    pub output_dir: Option<PathBuf>,
    pub force: bool,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PackRequest {
    pub fn new(source: impl Into<PathBuf>, component: Component) -> Self {
        Self {
            source: source.into(),
            component,
            compression: None,
            level: None,
            output_dir: None,
            force: false,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackResult {
    pub component: Component,
    pub archive: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    pub files: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ratio: f64,
    pub duration: Duration,
}

/// Archive `source`, write its manifest and register the component.
///
/// An existing archive or manifest for the same component is an error
/// unless `force` is set.
pub async fn pack(ctx: &Context, req: PackRequest) -> Result<PackResult, OpError> {
    let start = Instant::now();
    let component = &req.component;

    if !req.source.exists() {
        return Err(OpError::Validation(format!(
            "source not found: {}",
            req.source.display()
        )));
    }

    // The configured level belongs to the configured codec.
    let (compression, level) = match req.compression {
        Some(c) => (c, req.level),
        None => (
            ctx.settings.pack.compression,
            req.level.or(ctx.settings.pack.level),
        ),
    };
    compression.resolve_level(level)?;

    let filename = layout::archive_filename(component, &compression.archive_suffix());
    let out_dir = req
        .output_dir
        .clone()
        .unwrap_or_else(|| ctx.paths.dist_dir.clone());
    let archive_path = out_dir.join(&filename);
    let engine = ctx.manifests();

    if !req.force {
        if archive_path.exists() {
            return Err(OpError::FileExists(archive_path.display().to_string()));
        }
        if let Some(existing) = engine.find_manifest(component) {
            return Err(OpError::FileExists(existing.display().to_string()));
        }
    }

    ctx.paths.ensure_dirs()?;
    std::fs::create_dir_all(&out_dir)?;

    ctx.reporter.section(&format!("Packing {component}"));
    tracing::info!(%component, source = %req.source.display(), %compression, "packing");

    let archiver = ctx.archiver(component, compression, level)?;
    let output = archiver
        .compress(&[req.source.clone()], Destination::File(archive_path.clone()))
        .await?;
    let stats = output.stats;

    let manifest = engine
        .create_manifest(ManifestInput {
            component,
            source: &req.source,
            archive: &archive_path,
            stats: Some(&stats),
            metadata: req.metadata.clone(),
        })
        .await?;
    let written = engine.save_manifest(&manifest)?;

    ctx.registry()?.register(&manifest, &written)?;

    ctx.reporter.done(
        component,
        &format!("{} files, {:.1}% of original", stats.files, stats.ratio() * 100.0),
        Some(stats.bytes_out),
    );

    Ok(PackResult {
        component: component.clone(),
        archive: archive_path,
        manifest_path: written,
        manifest,
        files: stats.files,
        bytes_in: stats.bytes_in,
        bytes_out: stats.bytes_out,
        ratio: stats.ratio(),
        duration: start.elapsed(),
    })
}
