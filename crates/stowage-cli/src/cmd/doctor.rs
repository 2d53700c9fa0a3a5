use anyhow::Result;
use serde::Serialize;
use stowage_core::archive::Compression;
use stowage_core::{TOOL_VERSION, user_config_dir};

use super::{Session, print_json};

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    project_root: String,
    project_marker_found: bool,
    config_file: Option<String>,
    user_config_dir: Option<String>,
    storage: String,
    storage_reachable: bool,
    storage_error: Option<String>,
    codecs: Vec<Codec>,
}

#[derive(Debug, Serialize)]
struct Codec {
    name: &'static str,
    available: bool,
    feature: Option<&'static str>,
}

/// Report settings, storage reachability and compiled-in codecs.
pub async fn doctor(session: &Session) -> Result<()> {
    let mut ctx = session.context().await?;
    let root = ctx.paths.root.clone();
    let marker_found = ctx.project_root_of(&root).is_some();
    let config = ctx.paths.config_file();

    let listing = ctx.storage.list("releases/").await;
    let report = Report {
        version: TOOL_VERSION,
        project_root: root.display().to_string(),
        project_marker_found: marker_found,
        config_file: config.is_file().then(|| config.display().to_string()),
        user_config_dir: user_config_dir().map(|d| d.display().to_string()),
        storage: ctx.storage.location(),
        storage_reachable: listing.is_ok(),
        storage_error: listing.err().map(|e| e.to_string()),
        codecs: Compression::ALL
            .into_iter()
            .map(|c| Codec {
                name: c.name(),
                available: c.is_available(),
                feature: c.feature(),
            })
            .collect(),
    };

    if session.json {
        return print_json(&report);
    }

    let check = |ok: bool| if ok { "✓" } else { "✗" };
    println!();
    println!("  stow {}", report.version);
    println!(
        "  {} project   {}",
        check(report.project_marker_found),
        report.project_root
    );
    println!(
        "    config    {}",
        report.config_file.as_deref().unwrap_or("(none, using defaults)")
    );
    println!("  {} storage   {}", check(report.storage_reachable), report.storage);
    if let Some(err) = &report.storage_error {
        println!("    error     {err}");
    }
    println!();
    for codec in &report.codecs {
        match (codec.available, codec.feature) {
            (false, Some(feature)) => println!(
                "  {} {:<8} (rebuild with --features {feature})",
                check(false),
                codec.name
            ),
            (ok, _) => println!("  {} {}", check(ok), codec.name),
        }
    }
    Ok(())
}
