//! Orchestrator-level errors and their exit-code projection

use stowage_core::archive::ArchiveError;
use stowage_core::config::ConfigError;
use stowage_core::lock::LockError;
use stowage_core::manifest::ManifestError;
use stowage_core::registry::RegistryError;
use stowage_core::{Cancelled, StorageError};
use stowage_schema::{SchemaError, Sha256Digest};
use thiserror::Error;

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const VALIDATION: i32 = 3;
    pub const STORAGE: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const NOT_FOUND: i32 = 6;
    pub const ALREADY_EXISTS: i32 = 7;
    pub const NETWORK: i32 = 8;
    pub const CANCELLED: i32 = 130;
}

#[derive(Error, Debug)]
pub enum OpError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Release not found: {0}")]
    ReleaseNotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("Deployment verification failed: {0}")]
    Verification(String),

    #[error("{0} already exists (use --force to overwrite)")]
    FileExists(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Archive error: {0}")]
    Archive(ArchiveError),

    #[error("{0}")]
    Manifest(ManifestError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Lock(#[from] LockError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl OpError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Storage(e) => storage_exit_code(e),
            Self::Validation(_)
            | Self::Archive(ArchiveError::InvalidLevel { .. } | ArchiveError::UnknownAlgorithm(_))
            | Self::Manifest(ManifestError::MissingFields { .. } | ManifestError::Parse { .. }) => {
                exit::VALIDATION
            }
            Self::ComponentNotFound(_)
            | Self::ReleaseNotFound(_)
            | Self::Archive(ArchiveError::SourceNotFound(_))
            | Self::Manifest(ManifestError::ArchiveMissing(_)) => exit::NOT_FOUND,
            Self::FileExists(_) => exit::ALREADY_EXISTS,
            Self::Cancelled => exit::CANCELLED,
            Self::Config(_) => exit::CONFIG,
            Self::ChecksumMismatch { .. }
            | Self::Verification(_)
            | Self::Archive(_)
            | Self::Manifest(_)
            | Self::Registry(_)
            | Self::Lock(_)
            | Self::Io(_)
            | Self::Context { .. } => exit::GENERAL,
        }
    }
}

fn storage_exit_code(err: &StorageError) -> i32 {
    match err {
        StorageError::PermissionDenied { .. } => exit::PERMISSION,
        StorageError::NotFound(_) => exit::NOT_FOUND,
        StorageError::Connection(_) => exit::NETWORK,
        StorageError::Config(_) => exit::CONFIG,
        StorageError::InvalidKey(_) => exit::VALIDATION,
        StorageError::Cancelled => exit::CANCELLED,
        StorageError::DiskSpace(_) | StorageError::Remote { .. } | StorageError::Io(_) => {
            exit::STORAGE
        }
    }
}

impl From<StorageError> for OpError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

impl From<ArchiveError> for OpError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled => Self::Cancelled,
            other => Self::Archive(other),
        }
    }
}

impl From<ManifestError> for OpError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::NotFound(component) => Self::ComponentNotFound(component.to_string()),
            ManifestError::ChecksumMismatch {
                filename,
                expected,
                actual,
            } => Self::ChecksumMismatch {
                filename,
                expected,
                actual,
            },
            other => Self::Manifest(other),
        }
    }
}

impl From<SchemaError> for OpError {
    fn from(err: SchemaError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<Cancelled> for OpError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
