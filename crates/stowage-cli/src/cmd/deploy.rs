use std::path::PathBuf;

use anyhow::{Context as _, Result};
use stowage_schema::{Component, ReleaseVersion};

use super::{Session, failed, print_json};
use crate::ops::{DeployRequest, OpError, deploy as deploy_op};

/// Deploy a release, or one component, to `target`.
pub async fn deploy(
    session: &Session,
    release: Option<&str>,
    component: Option<&str>,
    target: PathBuf,
    no_verify: bool,
    checksums: bool,
    no_rollback: bool,
) -> Result<()> {
    let mut req = match (release, component) {
        (Some(release), _) => {
            let (version, _) = ReleaseVersion::parse(release).map_err(OpError::from)?;
            DeployRequest::release(version, target)
        }
        (None, Some(component)) => {
            let component: Component = component.parse().map_err(OpError::from)?;
            DeployRequest::component(component, target)
        }
        (None, None) => {
            return Err(OpError::Validation("either --release or --component is required".into()).into());
        }
    };
    req.verify = !no_verify;
    req.verify_checksums = checksums;
    req.rollback = !no_rollback;

    let ctx = session.context().await?;
    let mut result = deploy_op(&ctx, req).await.context("Failed to deploy")?;

    if session.json {
        print_json(&result)?;
    } else {
        println!();
        for deployed in &result.components {
            let note = if deployed.reused { " (already extracted)" } else { "" };
            println!(
                "  {:<32} {} -> {}{note}",
                deployed.component.to_string(),
                deployed.link,
                deployed.path
            );
        }
        if let Some(report) = &result.verification {
            println!("  verify: {}", report.summary());
        }
        if result.success {
            let what = result
                .release_version
                .as_ref()
                .map_or_else(|| "component".to_string(), |r| format!("release {r}"));
            println!(
                "\n  Deployed {what} to {} in {:.1}s",
                result.target.display(),
                result.duration.as_secs_f64()
            );
        } else if result.rolled_back {
            println!("\n  Deploy failed; target restored to its previous state");
        }
    }

    if result.success {
        Ok(())
    } else {
        Err(failed(result.failure.take(), "deploy"))
    }
}
