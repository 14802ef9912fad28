//! Watch root resolution.
//!
//! A root is either a literal directory or, when globbing is enabled, a glob
//! pattern such as `/vault/**/*.md`. Patterns are split into the literal
//! directory prefix (what actually gets watched) and the remainder (matched
//! against root-relative paths).

use crate::watch::error::WatcherError;
use globset::{GlobBuilder, GlobMatcher};
use std::path::{Path, PathBuf};

/// A resolved, accessible watch root.
#[derive(Debug, Clone)]
pub struct WatchRoot {
    base: PathBuf,
    pattern: Option<GlobMatcher>,
}

impl WatchRoot {
    /// Resolve `root` and check that its base directory is accessible.
    pub fn resolve(root: &Path, disable_globbing: bool) -> Result<Self, WatcherError> {
        let (base, pattern) = if disable_globbing {
            (root.to_path_buf(), None)
        } else {
            split_glob(root)
        };

        let pattern = pattern
            .map(|pattern| {
                GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()
                    .map(|glob| glob.compile_matcher())
                    .map_err(|source| WatcherError::InvalidGlob { pattern, source })
            })
            .transpose()?;

        let metadata =
            std::fs::metadata(&base).map_err(|e| WatcherError::from_root_io(base.clone(), e))?;
        if !metadata.is_dir() {
            return Err(WatcherError::NotADirectory { path: base });
        }
        // Listing catches unreadable directories that stat fine.
        std::fs::read_dir(&base).map_err(|e| WatcherError::from_root_io(base.clone(), e))?;

        Ok(Self { base, pattern })
    }

    /// The directory that is actually watched.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Whether the root was split into a base directory and a glob.
    pub fn is_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// Path relative to the base, or `None` for the base itself and for paths
    /// outside it.
    pub fn relative(&self, absolute: &Path) -> Option<PathBuf> {
        let relative = absolute.strip_prefix(&self.base).ok()?;
        if relative.as_os_str().is_empty() {
            None
        } else {
            Some(relative.to_path_buf())
        }
    }

    /// Whether a root-relative path is selected by the root's pattern.
    pub fn matches(&self, relative: &Path) -> bool {
        self.pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(relative))
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

/// Split a path into its literal directory prefix and the glob remainder.
fn split_glob(root: &Path) -> (PathBuf, Option<String>) {
    let mut base = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();

    for component in root.components() {
        let segment = component.as_os_str().to_string_lossy();
        if rest.is_empty() && !has_glob_meta(&segment) {
            base.push(component);
        } else {
            rest.push(segment.into_owned());
        }
    }

    if rest.is_empty() {
        (base, None)
    } else {
        if base.as_os_str().is_empty() {
            base.push(".");
        }
        (base, Some(rest.join("/")))
    }
}
