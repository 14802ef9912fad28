//! Vault File Watcher
//!
//! This crate watches a vault directory tree and tells the host's file index
//! about files that were added, changed or removed outside the host.
//!
//! ## Problems Addressed
//!
//! - Changes made by other programs (sync clients, editors, scripts) never
//!   reach the host index when its own watcher misses them (network mounts,
//!   WSL, some container filesystems).
//! - Partially written files are reported mid-write.
//! - The same change is reported more than once when two detection
//!   mechanisms overlap.
//!
//! ## Pipeline
//!
//! ```text
//! Filesystem Change
//!        ↓
//! EventSource (native notify watcher, or stat polling with text/binary intervals)
//!        ↓
//! hidden-path and glob filter
//!        ↓
//! StabilityFilter (awaitWriteFinish: hold add/change until size+mtime settle)
//!        ↓
//! DedupCache (drop events whose mtime was already forwarded)
//!        ↓
//! ConsumerSink::notify(kind, path)   [best-effort]
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vault_file_watcher::{
//!     sink::BroadcastSink,
//!     watch::{WatchConfig, WatcherController},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sink = BroadcastSink::new(256);
//!     let mut updates = sink.subscribe();
//!
//!     let controller = WatcherController::new(Arc::new(sink));
//!     let mut handle = controller.start(WatchConfig::new("/path/to/vault")).await?;
//!
//!     while let Ok(update) = updates.recv().await {
//!         println!("{} {}", update.kind, update.path.display());
//!     }
//!
//!     controller.stop(&mut handle);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`watch`]: watcher core
//!   - [`watch::config`]: settings, config snapshots and persistence
//!   - [`watch::source`]: native/polling event source
//!   - [`watch::stability`]: write-finish filter
//!   - [`watch::dedup`]: modification-time dedup cache
//!   - [`watch::controller`]: start/stop/reconfigure
//! - [`sink`]: consumer sink contract
//! - [`service`]: host lifecycle (load, update settings, unload)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod service;
pub mod sink;
pub mod watch;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::service::WatcherService;
    pub use crate::sink::{BroadcastSink, ConsumerSink, Notification, SinkError};
    pub use crate::watch::{
        BackendKind, ChangeEvent, ChangeKind, DedupCache, SettingsStore, WatchConfig,
        WatchSettings, WatcherController, WatcherControllerBuilder, WatcherError, WatcherHandle,
    };
}
