use anyhow::{Context as _, Result};
use stowage_core::registry::ComponentRegistry;
use stowage_schema::{Component, Version};

use super::{Session, print_json};
use crate::ComponentCommands;
use crate::ops::OpError;
use crate::ui::format_size;

pub fn components(session: &Session, command: ComponentCommands) -> Result<()> {
    let paths = session.paths()?;
    let mut registry = ComponentRegistry::open(paths).context("Failed to open component registry")?;

    match command {
        ComponentCommands::List { kind, limit } => list(session, &registry, kind.as_deref(), limit),
        ComponentCommands::Versions { kind } => {
            let versions = registry.list_versions(&kind);
            if session.json {
                return print_json(&versions);
            }
            if versions.is_empty() {
                println!("  No versions of '{kind}' known");
            }
            for version in versions {
                println!("  {kind}:{version}");
            }
            Ok(())
        }
        ComponentCommands::Search { query } => {
            let found = registry.search(&query);
            if session.json {
                return print_json(&found);
            }
            if found.is_empty() {
                println!("  No components match '{query}'");
            }
            for component in found {
                println!("  {component}");
            }
            Ok(())
        }
        ComponentCommands::Refresh => {
            registry.refresh().context("Failed to rebuild component registry")?;
            let stats = registry.stats();
            if session.json {
                return print_json(&stats);
            }
            println!(
                "  Indexed {} versions across {} types",
                stats.total_versions,
                stats.types.len()
            );
            Ok(())
        }
        ComponentCommands::Stats => {
            let stats = registry.stats();
            if session.json {
                return print_json(&stats);
            }
            println!();
            for (kind, ts) in &stats.types {
                let latest = ts.latest.as_ref().map_or("-", Version::as_str);
                println!(
                    "  {kind:<20} {:>4} versions  {:>10}  latest {latest}",
                    ts.versions,
                    format_size(ts.total_size)
                );
            }
            println!();
            println!(
                "  {} versions, {} total",
                stats.total_versions,
                format_size(stats.total_size)
            );
            Ok(())
        }
        ComponentCommands::Remove { component } => {
            let component: Component = component.parse().map_err(OpError::from)?;
            if !registry.unregister(&component)? {
                return Err(OpError::ComponentNotFound(component.to_string()).into());
            }
            if !session.json {
                println!("  Removed {component} from the registry index");
            }
            Ok(())
        }
    }
}

fn list(
    session: &Session,
    registry: &ComponentRegistry,
    kind: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let components = registry.list_components(kind, limit);
    if session.json {
        let rows: Vec<_> = components
            .iter()
            .map(|c| serde_json::json!({ "component": c, "entry": registry.find(c) }))
            .collect();
        return print_json(&rows);
    }
    if components.is_empty() {
        println!("  No components registered. Run 'stow pack' first.");
        return Ok(());
    }
    println!();
    for component in &components {
        let entry = registry.find(component);
        let size = entry.and_then(|e| e.size).map(format_size).unwrap_or_default();
        let created = entry
            .and_then(|e| e.created_at)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "  {:<20} {:<16} {size:>10}  {created}",
            component.kind.as_str(),
            component.version.as_str()
        );
    }
    Ok(())
}
