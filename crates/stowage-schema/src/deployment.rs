//! Per-target deployment metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What is currently published at a deploy target.
///
/// Persisted as one JSON document at the target root and owned by the
/// deploy operations for that target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Release currently pointed at by the top-level links, if any.
    pub release_version: Option<String>,
    /// When the state was last written.
    pub deployed_at: DateTime<Utc>,
    /// Component type to deployed version.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Link name (relative to the target) to link target.
    #[serde(default)]
    pub symlinks: BTreeMap<String, String>,
    /// Release that was current before the last switch.
    #[serde(default)]
    pub previous_version: Option<String>,
    /// Component type to extracted directory, relative to the target.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

impl DeploymentState {
    /// Empty state stamped with the current time.
    pub fn new() -> Self {
        Self {
            release_version: None,
            deployed_at: Utc::now(),
            components: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            previous_version: None,
            paths: BTreeMap::new(),
        }
    }
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self::new()
    }
}
