//! Command modules - one file per CLI command

pub mod components;
pub mod deploy;
pub mod doctor;
pub mod pack;
pub mod publish;
pub mod target;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use serde::Serialize;
use stowage_core::{CancelToken, ProjectLocator, ProjectPaths, Reporter};

use crate::ops::{Context, OpError, context::project_paths, exit};
use crate::ui::ConsoleReporter;

/// Global flags and process-wide handles shared by every command.
#[derive(Debug, Clone)]
pub struct Session {
    pub json: bool,
    pub project: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl Session {
    pub fn new(json: bool, project: Option<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            json,
            project,
            cancel,
        }
    }

    pub fn reporter(&self) -> Arc<dyn Reporter> {
        Arc::new(ConsoleReporter::new(self.json))
    }

    /// Full operation context: project, settings and storage.
    pub async fn context(&self) -> Result<Context> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let ctx = Context::discover(
            &cwd,
            self.project.clone(),
            self.reporter(),
            self.cancel.clone(),
            |k| std::env::var(k).ok(),
        )
        .await?;
        Ok(ctx)
    }

    /// Project layout only, for commands that never touch storage.
    pub fn paths(&self) -> Result<ProjectPaths> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(project_paths(
            &mut ProjectLocator::new(),
            &cwd,
            self.project.clone(),
        ))
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Turn a failure carried inside an operation result into an error.
pub fn failed(failure: Option<OpError>, what: &str) -> anyhow::Error {
    failure.map_or_else(|| anyhow!("{what} failed"), anyhow::Error::from)
}

/// Process exit code for an error returned by a command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OpError>())
        .map_or(exit::GENERAL, OpError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(OpError::ReleaseNotFound("r1".into()))
            .context("Failed to deploy");
        assert_eq!(exit_code(&err), exit::NOT_FOUND);
        assert_eq!(exit_code(&anyhow!("plain")), exit::GENERAL);
    }

    #[test]
    fn test_failed_keeps_operation_error() {
        let err = failed(Some(OpError::Cancelled), "publish");
        assert_eq!(exit_code(&err), exit::CANCELLED);
        assert_eq!(failed(None, "publish").to_string(), "publish failed");
    }
}
