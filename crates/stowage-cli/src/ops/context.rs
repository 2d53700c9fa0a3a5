//! Shared operation context.
//!
//! Built once at process start and passed by reference to every operation:
//! the project layout, loaded settings, the storage backend, the reporter
//! and the cancellation token. The project-root lookup memo lives here too,
//! so there is no process-wide path cache.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stowage_core::archive::{ArchiveOptions, Archiver, Compression};
use stowage_core::manifest::ManifestEngine;
use stowage_core::registry::ComponentRegistry;
use stowage_core::reporter::archive_progress;
use stowage_core::{
    BackendKind, CancelToken, ProjectLocator, ProjectPaths, Reporter, Settings, StorageBackend,
    create_backend, default_store_dir,
};
use stowage_schema::Component;

use super::OpError;

/// Groups common state used by pack, publish and deploy operations.
pub struct Context {
    pub paths: ProjectPaths,
    pub settings: Settings,
    pub storage: Arc<dyn StorageBackend>,
    pub reporter: Arc<dyn Reporter>,
    pub cancel: CancelToken,
    locator: ProjectLocator,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("root", &self.paths.root)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        paths: ProjectPaths,
        settings: Settings,
        storage: Arc<dyn StorageBackend>,
        reporter: Arc<dyn Reporter>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            paths,
            settings,
            storage,
            reporter,
            cancel,
            locator: ProjectLocator::new(),
        }
    }

    /// Find the project around `start`, load its settings and open storage.
    ///
    /// `root` pins the project root and skips discovery. Environment
    /// fallbacks are read through `env`.
    pub async fn discover<F>(
        start: &Path,
        root: Option<PathBuf>,
        reporter: Arc<dyn Reporter>,
        cancel: CancelToken,
        env: F,
    ) -> Result<Self, OpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut locator = ProjectLocator::new();
        let paths = project_paths(&mut locator, start, root);

        let mut settings = Settings::load_or_default(&paths.config_file())?.with_env(env);
        if settings.storage.kind == BackendKind::Filesystem && settings.storage.path.is_none() {
            settings.storage.path = default_store_dir();
        }
        let storage = create_backend(&settings.storage, cancel.clone()).await?;
        tracing::debug!(root = %paths.root.display(), storage = %storage.location(), "context ready");

        Ok(Self {
            paths,
            settings,
            storage,
            reporter,
            cancel,
            locator,
        })
    }

    /// Nearest project root above `dir`, memoized per context.
    pub fn project_root_of(&mut self, dir: &Path) -> Option<PathBuf> {
        self.locator.locate(dir)
    }

    pub fn manifests(&self) -> ManifestEngine {
        ManifestEngine::new(self.paths.clone())
    }

    pub fn registry(&self) -> Result<ComponentRegistry, OpError> {
        Ok(ComponentRegistry::open(self.paths.clone())?)
    }

    /// Archiver wired to this context's cancellation and reporter.
    pub fn archiver(
        &self,
        component: &Component,
        compression: Compression,
        level: Option<u32>,
    ) -> Result<Archiver, OpError> {
        let mut options =
            ArchiveOptions::new(compression).exclude(self.settings.pack.exclude_filter()?);
        if let Some(level) = level {
            options = options.level(level);
        }
        Ok(Archiver::new(options)
            .with_cancel(self.cancel.clone())
            .with_progress(archive_progress(
                Arc::clone(&self.reporter),
                component.clone(),
            )))
    }
}

/// Layout of the project around `start`, or of `root` when pinned.
///
/// With no marker above `start`, `start` itself is the root.
pub fn project_paths(locator: &mut ProjectLocator, start: &Path, root: Option<PathBuf>) -> ProjectPaths {
    let root = root.unwrap_or_else(|| locator.locate(start).unwrap_or_else(|| start.to_path_buf()));
    ProjectPaths::at(root)
}
