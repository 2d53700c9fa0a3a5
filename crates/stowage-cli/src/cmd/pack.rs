use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use stowage_core::archive::Compression;
use stowage_schema::Component;

use super::{Session, print_json};
use crate::ops::{OpError, PackRequest, pack as pack_op};
use crate::ui::format_size;

/// Pack `source` as `kind:version`.
#[allow(clippy::too_many_arguments)]
pub async fn pack(
    session: &Session,
    source: &Path,
    kind: &str,
    version: &str,
    compression: Option<Compression>,
    level: Option<u32>,
    output: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let component = Component::parse(kind, version).map_err(OpError::from)?;
    let ctx = session.context().await?;

    let mut req = PackRequest::new(source, component.clone());
    req.compression = compression;
    req.level = level;
    req.output_dir = output;
    req.force = force;

    let result = pack_op(&ctx, req)
        .await
        .with_context(|| format!("Failed to pack {component}"))?;

    if session.json {
        return print_json(&result);
    }

    println!();
    println!("  Packed {}", result.component);
    println!("    archive   {}", result.archive.display());
    println!("    manifest  {}", result.manifest_path.display());
    println!(
        "    files     {} ({} -> {}, {:.1}%)",
        result.files,
        format_size(result.bytes_in),
        format_size(result.bytes_out),
        result.ratio * 100.0
    );
    if let Some(sha) = &result.manifest.archive.checksum.sha256 {
        println!("    sha256    {sha}");
    }
    Ok(())
}
