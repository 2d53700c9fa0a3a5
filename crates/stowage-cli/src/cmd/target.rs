//! Target-local commands: switch, rollback, versions and status.
//!
//! These never open storage.

use std::path::Path;

use anyhow::{Context as _, Result, bail};
use stowage_schema::ReleaseVersion;

use super::{Session, print_json};
use crate::ops::{
    OpError, list_deployed_versions, rollback_release, status as target_status, switch_version,
    verify_deployment,
};

pub async fn switch(session: &Session, target: &Path, release: &str) -> Result<()> {
    let (release, _) = ReleaseVersion::parse(release).map_err(OpError::from)?;
    let reporter = session.reporter();
    let state = switch_version(target, &release, reporter.as_ref())
        .await
        .with_context(|| format!("Failed to switch {} to {release}", target.display()))?;
    if session.json {
        return print_json(&state);
    }
    println!("  {} -> {release}", target.display());
    Ok(())
}

pub async fn rollback(session: &Session, target: &Path) -> Result<()> {
    let reporter = session.reporter();
    let state = rollback_release(target, reporter.as_ref())
        .await
        .with_context(|| format!("Failed to roll back {}", target.display()))?;
    if session.json {
        return print_json(&state);
    }
    if let Some(current) = &state.release_version {
        println!("  {} -> {current}", target.display());
    }
    Ok(())
}

pub fn versions(session: &Session, target: &Path) -> Result<()> {
    let versions = list_deployed_versions(target)?;
    let current = target_status(target)?.and_then(|s| s.release_version);
    if session.json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("  No releases extracted at {}", target.display());
        return Ok(());
    }
    for version in &versions {
        let marker = if current.as_deref() == Some(version.as_str()) { "*" } else { " " };
        println!("  {marker} {version}");
    }
    Ok(())
}

pub async fn status(session: &Session, target: &Path, verify: bool, checksums: bool) -> Result<()> {
    let Some(state) = target_status(target)? else {
        bail!(OpError::Validation(format!(
            "nothing deployed at {}",
            target.display()
        )));
    };
    let report = if verify {
        Some(verify_deployment(target, checksums).await?)
    } else {
        None
    };

    if session.json {
        print_json(&serde_json::json!({ "state": state, "verification": report }))?;
    } else {
        println!();
        println!("  Target    {}", target.display());
        println!(
            "  Release   {}",
            state.release_version.as_deref().unwrap_or("(standalone components)")
        );
        if let Some(previous) = &state.previous_version {
            println!("  Previous  {previous}");
        }
        println!("  Deployed  {}", state.deployed_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!();
        for (kind, version) in &state.components {
            let path = state.paths.get(kind).map_or("", String::as_str);
            println!("  {kind:<20} {version:<16} {path}");
        }
        if let Some(report) = &report {
            println!();
            println!("  verify: {}", report.summary());
        }
    }

    match report {
        Some(report) if !report.is_ok() => {
            Err(OpError::Verification(report.summary()).into())
        }
        _ => Ok(()),
    }
}
