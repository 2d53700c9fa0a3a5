use anyhow::{Context as _, Result};
use stowage_schema::{Component, ReleaseVersion, ReleaseVersionKind};

use super::{Session, failed, print_json};
use crate::ops::{ComponentStatus, OpError, PublishRequest, publish as publish_op};
use crate::ui::format_size;

/// Publish `TYPE:VERSION` components, optionally grouped as a release.
pub async fn publish(
    session: &Session,
    components: &[String],
    release: Option<&str>,
    name: Option<String>,
    force: bool,
    no_atomic: bool,
) -> Result<()> {
    let components = components
        .iter()
        .map(|s| s.parse::<Component>().map_err(OpError::from))
        .collect::<Result<Vec<_>, _>>()?;

    let mut req = PublishRequest::new(components);
    if let Some(release) = release {
        let (version, kind) = ReleaseVersion::parse(release).map_err(OpError::from)?;
        if kind == ReleaseVersionKind::Custom {
            tracing::warn!(%version, "release version is neither a date nor semver");
        }
        req = req.release(version);
    }
    req.release_name = name;
    req.force = force;
    req.atomic = !no_atomic;

    let ctx = session.context().await?;
    let mut result = publish_op(&ctx, req)
        .await
        .context("Failed to publish")?;

    if session.json {
        print_json(&result)?;
    } else {
        println!();
        for outcome in &result.components {
            let note = match &outcome.status {
                ComponentStatus::Published { bytes } => format!("published ({})", format_size(*bytes)),
                ComponentStatus::AlreadyPublished => "already published".to_string(),
                ComponentStatus::Failed { error } => format!("failed: {error}"),
                ComponentStatus::RolledBack => "rolled back".to_string(),
            };
            println!("  {:<32} {note}", outcome.component.to_string());
        }
        if let Some(release) = &result.release_version {
            println!();
            println!("  Release {release} published to {}", ctx.storage.location());
        }
        println!(
            "  {} transferred in {:.1}s",
            format_size(result.bytes_transferred),
            result.duration.as_secs_f64()
        );
    }

    if result.success {
        Ok(())
    } else {
        Err(failed(result.failure.take(), "publish"))
    }
}
