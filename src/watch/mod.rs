//! Watcher core.
//!
//! This module provides:
//! - `config`: watcher settings, validated config snapshots and persistence
//! - `root`: literal and glob watch roots
//! - `event`: change events and the hidden-path rule
//! - `source`: native/polling event source adapter
//! - `poller`: stat-based polling backend
//! - `stability`: write-finish (stability) filter
//! - `dedup`: modification-time dedup cache
//! - `controller`: start/stop/reconfigure and the forwarding pipeline

pub mod config;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod event;
pub mod poller;
pub mod root;
pub mod source;
pub mod stability;

pub use config::{SettingsStore, StabilitySettings, WatchConfig, WatchSettings};
pub use controller::{WatcherController, WatcherControllerBuilder, WatcherHandle};
pub use dedup::{DedupCache, DedupEntry, DedupStats};
pub use error::WatcherError;
pub use event::{is_hidden, ChangeEvent, ChangeKind};
pub use root::WatchRoot;
pub use source::{BackendKind, EventSource};
pub use stability::StabilityFilter;
