//! stow - pack, publish and deploy versioned artifacts
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! # Overview
//!
//! A component is a directory packed into a compressed tar archive and
//! described by a manifest. Components are published to a storage backend
//! (a local directory, S3 or BOS), optionally grouped into a release, and
//! deployed to a target directory where a stable name per component type is
//! switched atomically between immutable versioned extractions.
//!
//! # Target Layout
//!
//! ```text
//! <target>/
//! ├── releases/<release>/<type>/<version>/   # immutable extractions
//! ├── <type> -> releases/<release>/<type>/<version>
//! ├── .manifests/                            # fetched component manifests
//! ├── .archives/                             # fetched archives
//! ├── .stowage-deploy.json                   # deployment state
//! └── .stowage-deploy.lock
//! ```

pub mod cmd;
pub mod ops;
pub mod ui;

pub use stowage_core::paths::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stowage_core::archive::Compression;

#[derive(Debug, Parser)]
#[command(name = "stow")]
#[command(author, version, about = "stow - pack, publish and deploy versioned artifacts")]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Project root (defaults to the nearest directory with stowage.toml, deployment/ or .git)
    #[arg(long, global = true, env = "STOWAGE_PROJECT")]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pack a directory into a component archive and manifest
    Pack {
        /// Directory (or file) to pack
        source: PathBuf,
        /// Component type, e.g. model
        #[arg(short = 't', long = "type")]
        kind: String,
        /// Component version, e.g. 1.0.0
        #[arg(short = 'V', long)]
        version: String,
        /// Compression algorithm (defaults to [pack].compression)
        #[arg(short, long)]
        compression: Option<Compression>,
        /// Compression level
        #[arg(short, long)]
        level: Option<u32>,
        /// Output directory for the archive (defaults to dist/)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing archive and manifest
        #[arg(short, long)]
        force: bool,
    },
    /// Publish packed components, optionally as a release
    Publish {
        /// Components as TYPE:VERSION
        #[arg(required = true)]
        components: Vec<String>,
        /// Release version to create, e.g. 2024.01.20
        #[arg(short, long)]
        release: Option<String>,
        /// Human-readable release name
        #[arg(long, requires = "release")]
        name: Option<String>,
        /// Re-upload components and overwrite an existing release
        #[arg(short, long)]
        force: bool,
        /// Keep components that published successfully when others fail
        #[arg(long)]
        no_atomic: bool,
    },
    /// Deploy a release or a single component to a target directory
    Deploy {
        /// Release version to deploy
        #[arg(short, long, conflicts_with = "component", required_unless_present = "component")]
        release: Option<String>,
        /// Single component as TYPE:VERSION
        #[arg(short, long)]
        component: Option<String>,
        /// Target directory
        #[arg(short = 'T', long)]
        target: PathBuf,
        /// Skip post-deploy verification
        #[arg(long)]
        no_verify: bool,
        /// Also verify per-file checksums
        #[arg(long, conflicts_with = "no_verify")]
        checksums: bool,
        /// Leave partial changes in place on failure
        #[arg(long)]
        no_rollback: bool,
    },
    /// Point a target at a release that is already extracted there
    Switch {
        /// Target directory
        #[arg(short = 'T', long)]
        target: PathBuf,
        /// Release version
        release: String,
    },
    /// Switch a target back to its previous release
    Rollback {
        /// Target directory
        #[arg(short = 'T', long)]
        target: PathBuf,
    },
    /// List releases extracted at a target
    Versions {
        /// Target directory
        #[arg(short = 'T', long)]
        target: PathBuf,
    },
    /// Show the deployment state of a target
    Status {
        /// Target directory
        #[arg(short = 'T', long)]
        target: PathBuf,
        /// Re-verify deployed files
        #[arg(long)]
        verify: bool,
        /// Also verify per-file checksums
        #[arg(long, requires = "verify")]
        checksums: bool,
    },
    /// Query the local component registry
    Components {
        #[command(subcommand)]
        command: ComponentCommands,
    },
    /// Check settings, storage and codec availability
    Doctor,
}

#[derive(Debug, Subcommand)]
pub enum ComponentCommands {
    /// List known components
    List {
        /// Only this component type
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
        /// Maximum number of entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show all versions of a component type
    Versions {
        /// Component type
        kind: String,
    },
    /// Search components by type or version substring
    Search {
        /// Search term
        query: String,
    },
    /// Rebuild the registry index from manifests on disk
    Refresh,
    /// Show registry statistics
    Stats,
    /// Remove a component from the registry index
    Remove {
        /// Component as TYPE:VERSION
        component: String,
    },
}
