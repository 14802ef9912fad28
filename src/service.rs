//! Host lifecycle glue.
//!
//! `WatcherService` is what a host embeds: it loads the persisted settings
//! and starts watching on load, persists and applies new settings (through a
//! transactional reconfigure), and stops watching on unload.

use crate::sink::ConsumerSink;
use crate::watch::{
    DedupCache, SettingsStore, WatchSettings, WatcherController, WatcherControllerBuilder,
    WatcherError, WatcherHandle,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A vault watcher bound to one root and one settings file.
pub struct WatcherService {
    controller: WatcherController,
    store: SettingsStore,
    settings: WatchSettings,
    root: PathBuf,
    handle: Option<WatcherHandle>,
}

impl WatcherService {
    /// Load settings and start watching `root`.
    pub async fn load(
        root: impl Into<PathBuf>,
        store: SettingsStore,
        sink: Arc<dyn ConsumerSink>,
    ) -> Result<Self, WatcherError> {
        Self::load_with(root, store, WatcherControllerBuilder::new(sink)).await
    }

    /// Like [`WatcherService::load`], with a customized controller.
    pub async fn load_with(
        root: impl Into<PathBuf>,
        store: SettingsStore,
        builder: WatcherControllerBuilder,
    ) -> Result<Self, WatcherError> {
        let root = root.into();
        tracing::info!("Loading file watcher for {}", root.display());

        let settings = store.load()?;
        let controller = builder.build();
        let handle = controller.start(settings.to_config(&root)?).await?;

        Ok(Self {
            controller,
            store,
            settings,
            root,
            handle: Some(handle),
        })
    }

    /// Directory (or glob pattern) being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    /// The running watcher, until [`WatcherService::unload`].
    pub fn handle(&self) -> Option<&WatcherHandle> {
        self.handle.as_ref()
    }

    /// Dedup cache shared by every watcher this service starts.
    pub fn dedup(&self) -> &Arc<DedupCache> {
        self.controller.dedup()
    }

    /// Swap in a watcher that uses `settings`, then persist them.
    ///
    /// If the new watcher cannot start, the previous one keeps running and
    /// nothing is persisted. A failure to persist is reported after the new
    /// settings are already in effect.
    pub async fn update_settings(&mut self, settings: WatchSettings) -> Result<(), WatcherError> {
        let config = settings.to_config(&self.root)?;

        match self.handle.as_mut() {
            Some(handle) => self.controller.reconfigure(handle, config).await?,
            None => self.handle = Some(self.controller.start(config).await?),
        }
        self.settings = settings;
        self.store.save(&self.settings)
    }

    /// Stop watching. Safe to call more than once.
    pub fn unload(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            tracing::info!("Unloading file watcher for {}", self.root.display());
            self.controller.stop(&mut handle);
        }
    }
}

impl Drop for WatcherService {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BroadcastSink;
    use crate::watch::{BackendKind, ChangeKind};
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_settings() -> WatchSettings {
        WatchSettings {
            interval: 25,
            binary_interval: 50,
            await_write_finish: false,
            ..WatchSettings::default()
        }
    }

    #[tokio::test]
    async fn test_load_uses_stored_settings() {
        let vault = tempdir().unwrap();
        let config_dir = tempdir().unwrap();
        let store = SettingsStore::new(config_dir.path().join("settings.toml"));
        store.save(&fast_settings()).unwrap();

        let service = WatcherService::load(vault.path(), store, Arc::new(BroadcastSink::new(16)))
            .await
            .unwrap();

        assert_eq!(service.settings(), &fast_settings());
        let handle = service.handle().unwrap();
        assert_eq!(handle.backend(), Some(BackendKind::Polling));
        assert_eq!(handle.config().poll_interval, Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_update_settings_persists_and_reconfigures() {
        let vault = tempdir().unwrap();
        let config_dir = tempdir().unwrap();
        let path = config_dir.path().join("settings.toml");
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        let mut service =
            WatcherService::load(vault.path(), SettingsStore::new(&path), Arc::new(sink))
                .await
                .unwrap();
        let first_id = service.handle().unwrap().id();

        let updated = WatchSettings {
            binary_interval: 75,
            ..fast_settings()
        };
        service.update_settings(updated.clone()).await.unwrap();

        assert_ne!(service.handle().unwrap().id(), first_id);
        assert_eq!(SettingsStore::new(&path).load().unwrap(), updated);

        std::fs::write(vault.path().join("note.md"), "x").unwrap();
        let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.kind, ChangeKind::Added);
    }

    #[tokio::test]
    async fn test_invalid_settings_keep_current_watcher() {
        let vault = tempdir().unwrap();
        let config_dir = tempdir().unwrap();
        let path = config_dir.path().join("settings.toml");
        let mut service = WatcherService::load(
            vault.path(),
            SettingsStore::new(&path),
            Arc::new(BroadcastSink::new(16)),
        )
        .await
        .unwrap();
        let id = service.handle().unwrap().id();

        let broken = WatchSettings {
            stability_threshold: 0,
            ..WatchSettings::default()
        };
        assert!(service.update_settings(broken).await.is_err());
        assert_eq!(service.handle().unwrap().id(), id);
        assert_eq!(service.settings(), &WatchSettings::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unload_twice() {
        let vault = tempdir().unwrap();
        let config_dir = tempdir().unwrap();
        let mut service = WatcherService::load(
            vault.path(),
            SettingsStore::new(config_dir.path().join("settings.toml")),
            Arc::new(BroadcastSink::new(16)),
        )
        .await
        .unwrap();

        service.unload();
        service.unload();
        assert!(service.handle().is_none());
    }
}
