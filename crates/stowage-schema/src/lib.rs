//! Shared types and wire format for stowage.
//!
//! Everything that crosses a process or host boundary lives here: component
//! identities, digests, the manifest and release-manifest documents, the
//! per-target deployment state, and the storage key layout.

pub mod deployment;
pub mod hash;
pub mod layout;
pub mod manifest;
pub mod release;
pub mod types;

pub use deployment::DeploymentState;
pub use hash::{Blake3Hash, Sha256Digest};
pub use manifest::{
    ArchiveInfo, BuildInfo, Checksums, FileRecord, MANIFEST_VERSION, Manifest, PackageInfo,
};
pub use release::{ComponentRef, ReleaseInfo, ReleaseManifest};
pub use types::{Component, ComponentType, ReleaseVersion, ReleaseVersionKind, Version};

/// Validation failures for schema values.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    /// A component type tag failed validation.
    #[error("Invalid component type '{value}': {reason}")]
    InvalidComponentType {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A component version does not match the semantic version pattern.
    #[error("Invalid version '{0}': expected MAJOR.MINOR.PATCH[-pre][+build]")]
    InvalidVersion(String),

    /// A release version failed validation.
    #[error("Invalid release version '{value}': {reason}")]
    InvalidReleaseVersion {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A `type:version` spec could not be split.
    #[error("Invalid component '{0}': expected TYPE:VERSION")]
    InvalidComponentSpec(String),

    /// A digest string is malformed.
    #[error("Invalid SHA256 digest: {0}")]
    InvalidDigest(String),

    /// A built-in validation pattern failed to compile.
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}
