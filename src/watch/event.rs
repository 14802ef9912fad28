//! Change events as seen by the watcher pipeline.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Kind of change reported for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Reported to the host as `add`.
    Added,
    /// Reported to the host as `change`.
    Changed,
    /// Reported to the host as `unlink`.
    Removed,
}

impl ChangeKind {
    /// Event name understood by the host index (`add`, `change`, `unlink`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "add",
            ChangeKind::Changed => "change",
            ChangeKind::Removed => "unlink",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A single file change, with its path relative to the watch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened to the file.
    pub kind: ChangeKind,
    /// Path relative to the watch root.
    pub path: PathBuf,
    /// Modification time observed for the file. Removals carry the last
    /// known value when the source still has one.
    pub mod_time: Option<SystemTime>,
    /// Whether the path looks like a binary file.
    pub is_binary_hint: bool,
}

impl ChangeEvent {
    /// Build an event, deriving the binary hint from the path.
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>, mod_time: Option<SystemTime>) -> Self {
        let path = path.into();
        let is_binary_hint = is_binary_path(&path);
        Self {
            kind,
            path,
            mod_time,
            is_binary_hint,
        }
    }

    /// A new file.
    pub fn added(path: impl Into<PathBuf>, mod_time: SystemTime) -> Self {
        Self::new(ChangeKind::Added, path, Some(mod_time))
    }

    /// An existing file was written.
    pub fn changed(path: impl Into<PathBuf>, mod_time: SystemTime) -> Self {
        Self::new(ChangeKind::Changed, path, Some(mod_time))
    }

    /// A file is gone.
    pub fn removed(path: impl Into<PathBuf>, last_mod_time: Option<SystemTime>) -> Self {
        Self::new(ChangeKind::Removed, path, last_mod_time)
    }
}

/// Whether any component of a root-relative path is hidden (starts with `.`).
///
/// A file inside a dot-directory is hidden even if its own name is not.
pub fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Extensions treated as binary for polling purposes.
const BINARY_EXTENSIONS: &[&str] = &[
    "3gp", "7z", "aac", "avi", "bin", "bmp", "bz2", "class", "dat", "db", "dll", "dmg", "doc",
    "docx", "dylib", "eot", "exe", "flac", "gif", "gz", "heic", "ico", "iso", "jar", "jpeg",
    "jpg", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "o", "odt", "ogg", "otf", "pdf", "png",
    "ppt", "pptx", "psd", "pyc", "rar", "so", "sqlite", "tar", "tgz", "tif", "tiff", "ttf",
    "wasm", "wav", "webm", "webp", "woff", "woff2", "xls", "xlsx", "xz", "zip",
];

/// Guess from the extension whether a path is a binary file.
pub fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            BINARY_EXTENSIONS.binary_search(&ext.as_str()).is_ok()
        })
        .unwrap_or(false)
}
