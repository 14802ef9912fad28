//! Error types for the watcher core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or starting a watcher.
///
/// Only configuration and start-up problems surface here. Problems that
/// happen while a watcher is running (a failed stat, a failing sink) are
/// logged and skipped instead.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Watch root {path} is not accessible: {source}")]
    InvalidRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Permission denied for watch root {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Watch root {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Invalid glob pattern {pattern}: {source}")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create watcher: {0}")]
    WatcherCreation(#[from] notify::Error),

    #[error("Failed to watch path {path}: {source}")]
    WatchPath {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("Failed to read settings {path}: {source}")]
    SettingsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write settings {path}: {source}")]
    SettingsWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    SettingsSerialize(#[from] toml::ser::Error),
}

impl WatcherError {
    /// Map an I/O error on the watch root to the matching variant.
    pub(crate) fn from_root_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            WatcherError::PermissionDenied { path }
        } else {
            WatcherError::InvalidRoot { path, source }
        }
    }
}
