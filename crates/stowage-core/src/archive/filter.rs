//! Exclude patterns applied while walking pack sources.

use std::path::Path;

use glob::Pattern;

use super::ArchiveError;

/// Patterns excluded from packs unless overridden.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "*.log",
    "__pycache__/",
    ".DS_Store",
    ".git/",
    "*.tmp",
    "*.cache",
    "*.pyc",
    "*.pyo",
    ".pytest_cache/",
    ".mypy_cache/",
    ".tox/",
    "*.egg-info/",
    "build/",
    "dist/",
];

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    dir_only: bool,
}

/// Glob exclusion list. A trailing `/` restricts a pattern to directories.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    rules: Vec<Rule>,
}

impl ExcludeFilter {
    /// Excludes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// The [`DEFAULT_EXCLUDES`] list.
    pub fn defaults() -> Self {
        let patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect();
        // The built-in list is known-good.
        Self::new(&patterns).unwrap_or_default()
    }

    pub fn new(patterns: &[String]) -> Result<Self, ArchiveError> {
        let rules = patterns
            .iter()
            .map(|raw| {
                let dir_only = raw.ends_with('/');
                let body = raw.trim_end_matches('/');
                Pattern::new(body)
                    .map(|pattern| Rule { pattern, dir_only })
                    .map_err(|e| ArchiveError::Pattern {
                        pattern: raw.clone(),
                        message: e.msg.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `rel` (relative to a source root) should be skipped.
    ///
    /// Patterns are tried against the entry's own name and against the
    /// whole `/`-joined relative path.
    pub fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        let Some(name) = rel.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        let full = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        self.rules.iter().any(|rule| {
            if rule.dir_only && !is_dir {
                return false;
            }
            rule.pattern.matches(&name) || rule.pattern.matches(&full)
        })
    }
}
