//! Watcher configuration.
//!
//! Two shapes live here:
//! - [`WatchSettings`]: the persisted settings blob, in the host's key names
//!   and with millisecond integers.
//! - [`WatchConfig`]: the validated, immutable snapshot a watcher is started
//!   with. A running watcher never observes a change to it; reconfiguring
//!   replaces the whole watcher.

use crate::watch::error::WatcherError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted watcher settings.
///
/// Keys that are missing from the stored blob take their default value, so an
/// older or partial settings file is merged over the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchSettings {
    /// Resolve symlinked files and directories as watch targets.
    pub follow_symlinks: bool,
    /// Treat the root path literally instead of as a glob pattern.
    pub disable_globbing: bool,
    /// Force stat-based polling instead of native OS events.
    pub use_polling: bool,
    /// Poll period for non-binary files, in milliseconds.
    pub interval: u64,
    /// Poll period for binary files, in milliseconds.
    pub binary_interval: u64,
    /// Hold add/change events until the file stops changing.
    pub await_write_finish: bool,
    /// Quiet period before a write counts as finished, in milliseconds.
    #[serde(rename = "awaitWriteFinish_stabilityThreshold")]
    pub stability_threshold: u64,
    /// How often a pending write is re-examined, in milliseconds.
    #[serde(rename = "awaitWriteFinish_pollInterval")]
    pub stability_poll_interval: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            follow_symlinks: true,
            disable_globbing: false,
            use_polling: true,
            interval: 100,
            binary_interval: 300,
            await_write_finish: true,
            stability_threshold: 2000,
            stability_poll_interval: 100,
        }
    }
}

impl WatchSettings {
    /// Build a validated [`WatchConfig`] for `root` from these settings.
    pub fn to_config(&self, root: impl Into<PathBuf>) -> Result<WatchConfig, WatcherError> {
        let config = WatchConfig {
            root: root.into(),
            follow_symlinks: self.follow_symlinks,
            disable_globbing: self.disable_globbing,
            use_polling: self.use_polling,
            poll_interval: Duration::from_millis(self.interval),
            binary_poll_interval: Duration::from_millis(self.binary_interval),
            await_write_finish: self.await_write_finish,
            stability_threshold: Duration::from_millis(self.stability_threshold),
            stability_poll_interval: Duration::from_millis(self.stability_poll_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Immutable snapshot of watcher tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Directory (or glob pattern, unless globbing is disabled) to watch.
    pub root: PathBuf,
    /// Descend into symlinked directories and watch symlinked files.
    pub follow_symlinks: bool,
    /// Treat `root` literally even if it contains glob characters.
    pub disable_globbing: bool,
    /// Poll with `stat` instead of using native notifications.
    pub use_polling: bool,
    /// Poll period for non-binary files.
    pub poll_interval: Duration,
    /// Poll period for binary files.
    pub binary_poll_interval: Duration,
    /// Hold add/change events until the file stops changing.
    pub await_write_finish: bool,
    /// How long a file must stay unchanged to count as written.
    pub stability_threshold: Duration,
    /// How often a pending file is re-examined.
    pub stability_poll_interval: Duration,
}

/// Timing for the write-stability filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilitySettings {
    /// Quiet period before a write counts as finished.
    pub threshold: Duration,
    /// Re-stat period while waiting.
    pub poll_interval: Duration,
}

impl WatchConfig {
    /// Config for `root` with the default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let defaults = WatchSettings::default();
        Self {
            root: root.into(),
            follow_symlinks: defaults.follow_symlinks,
            disable_globbing: defaults.disable_globbing,
            use_polling: defaults.use_polling,
            poll_interval: Duration::from_millis(defaults.interval),
            binary_poll_interval: Duration::from_millis(defaults.binary_interval),
            await_write_finish: defaults.await_write_finish,
            stability_threshold: Duration::from_millis(defaults.stability_threshold),
            stability_poll_interval: Duration::from_millis(defaults.stability_poll_interval),
        }
    }

    /// Force (or stop forcing) the polling backend.
    pub fn with_polling(mut self, enabled: bool) -> Self {
        self.use_polling = enabled;
        self
    }

    /// Set the text and binary poll periods.
    pub fn with_poll_intervals(mut self, interval: Duration, binary_interval: Duration) -> Self {
        self.poll_interval = interval;
        self.binary_poll_interval = binary_interval;
        self
    }

    /// Enable or disable the stability filter.
    pub fn with_await_write_finish(
        mut self,
        enabled: bool,
        threshold: Duration,
        poll_interval: Duration,
    ) -> Self {
        self.await_write_finish = enabled;
        self.stability_threshold = threshold;
        self.stability_poll_interval = poll_interval;
        self
    }

    /// Choose whether symlinks are followed.
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Choose whether the root is matched as a glob.
    pub fn with_disable_globbing(mut self, disable: bool) -> Self {
        self.disable_globbing = disable;
        self
    }

    /// Check that every duration is positive.
    ///
    /// `stability_poll_interval > stability_threshold` is allowed; it only
    /// makes stability detection coarser.
    pub fn validate(&self) -> Result<(), WatcherError> {
        let durations = [
            ("interval", self.poll_interval),
            ("binaryInterval", self.binary_poll_interval),
            ("awaitWriteFinish_stabilityThreshold", self.stability_threshold),
            ("awaitWriteFinish_pollInterval", self.stability_poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(WatcherError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.stability_poll_interval > self.stability_threshold {
            tracing::debug!(
                "awaitWriteFinish poll interval {:?} exceeds stability threshold {:?}",
                self.stability_poll_interval,
                self.stability_threshold
            );
        }
        Ok(())
    }

    /// Stability timing, or `None` when the filter is disabled.
    pub fn stability(&self) -> Option<StabilitySettings> {
        self.await_write_finish.then_some(StabilitySettings {
            threshold: self.stability_threshold,
            poll_interval: self.stability_poll_interval,
        })
    }
}

/// Loads and saves [`WatchSettings`] as a TOML file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by the file at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when no file exists yet.
    pub fn load(&self) -> Result<WatchSettings, WatcherError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "No settings at {}, using defaults",
                    self.path.display()
                );
                return Ok(WatchSettings::default());
            }
            Err(source) => {
                return Err(WatcherError::SettingsRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        toml::from_str(&contents).map_err(|source| WatcherError::SettingsParse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write `settings`, replacing the file contents.
    pub fn save(&self, settings: &WatchSettings) -> Result<(), WatcherError> {
        let contents = toml::to_string_pretty(settings)?;
        std::fs::write(&self.path, contents).map_err(|source| WatcherError::SettingsWrite {
            path: self.path.clone(),
            source,
        })
    }
}
