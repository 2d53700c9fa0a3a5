//! File naming and storage key layout.
//!
//! Keys are `/`-separated and identical across every storage backend, so a
//! release published to one copy of a store can be deployed from another.
//!
//! ```text
//! {type}/{version}/{type}-{version}.tar.gz
//! {type}/{version}/{type}-{version}.manifest.json
//! releases/{version}.release.json
//! ```

use crate::types::{Component, ReleaseVersion};

/// Key prefix under which release manifests live.
pub const RELEASES_PREFIX: &str = "releases";

/// Archive file name for a component, e.g. `model-1.0.0.tar.gz`.
///
/// `suffix` is the full archive suffix including the leading dot
/// (`.tar`, `.tar.gz`, ...).
pub fn archive_filename(component: &Component, suffix: &str) -> String {
    format!("{}-{}{suffix}", component.kind, component.version)
}

/// Manifest file name for a component, e.g. `model-1.0.0.manifest.json`.
pub fn manifest_filename(component: &Component) -> String {
    format!("{}-{}.manifest.json", component.kind, component.version)
}

/// Release manifest file name, e.g. `2024.01.20.release.json`.
pub fn release_filename(version: &ReleaseVersion) -> String {
    format!("{version}.release.json")
}

/// Storage key of a component archive.
pub fn archive_key(component: &Component, filename: &str) -> String {
    format!("{}/{}/{filename}", component.kind, component.version)
}

/// Storage key of a component manifest.
pub fn manifest_key(component: &Component) -> String {
    format!(
        "{}/{}/{}",
        component.kind,
        component.version,
        manifest_filename(component)
    )
}

/// Storage key of a release manifest.
pub fn release_key(version: &ReleaseVersion) -> String {
    format!("{RELEASES_PREFIX}/{}", release_filename(version))
}
