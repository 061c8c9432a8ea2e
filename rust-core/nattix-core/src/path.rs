//! # Paths
//!
//! Resolves project-relative paths (routes, assets, plugins, templates,
//! configs) against the application root.

use std::path::{Path, PathBuf};

/// Joins a base directory with relative segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    /// Create a resolver; trailing separators on `base` are dropped
    pub fn new(base: impl AsRef<Path>) -> Self {
        let raw = base.as_ref().to_string_lossy();
        let trimmed = raw.trim_end_matches(std::path::MAIN_SEPARATOR);
        let base = if trimmed.is_empty() && !raw.is_empty() {
            PathBuf::from(std::path::MAIN_SEPARATOR.to_string())
        } else {
            PathBuf::from(trimmed)
        };
        Self { base }
    }

    /// Base directory
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `base/segment/...`, leading slashes of each segment ignored
    #[must_use]
    pub fn resolve(&self, segments: &[&str]) -> PathBuf {
        segments.iter().fold(self.base.clone(), |mut path, segment| {
            let segment = segment.trim_start_matches('/');
            if !segment.is_empty() {
                path.push(segment);
            }
            path
        })
    }

    /// Route definition directory
    #[must_use]
    pub fn routes_path(&self) -> PathBuf {
        self.resolve(&["routes"])
    }

    /// Public assets directory
    #[must_use]
    pub fn assets_path(&self) -> PathBuf {
        self.resolve(&["public", "assets"])
    }

    /// Plugin directory
    #[must_use]
    pub fn plugins_path(&self) -> PathBuf {
        self.resolve(&["plugins"])
    }

    /// Template directory
    #[must_use]
    pub fn templates_path(&self) -> PathBuf {
        self.resolve(&["templates"])
    }

    /// Configuration directory
    #[must_use]
    pub fn configs_path(&self) -> PathBuf {
        self.resolve(&["configs"])
    }
}
