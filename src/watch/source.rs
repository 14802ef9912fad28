//! Event source adapter.
//!
//! Hides whether changes come from native OS notifications or from the
//! polling backend. Either way the subscriber gets one stream of
//! [`ChangeEvent`]s with root-relative paths.
//!
//! Native watching falls back to polling when the OS watcher cannot be
//! created or cannot watch the root (network mounts, exhausted inotify
//! watches).

use crate::watch::config::WatchConfig;
use crate::watch::error::WatcherError;
use crate::watch::event::ChangeEvent;
use crate::watch::poller::{scan_blocking, scan_dir, PollOptions, Poller, Scan};
use crate::watch::root::WatchRoot;
use notify::event::{ModifyKind, RemoveKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Which detection mechanism a source is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OS notifications through `notify`.
    Native,
    /// Periodic tree walks.
    Polling,
}

enum Backend {
    Native(RecommendedWatcher),
    Polling(Poller),
}

/// A running change-detection backend bound to one root.
pub struct EventSource {
    backend: Option<Backend>,
    root: WatchRoot,
}

impl EventSource {
    /// Start detecting changes under `root` according to `config`.
    ///
    /// Files that already exist are not reported; only later changes are.
    pub async fn subscribe(
        root: WatchRoot,
        config: &WatchConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>), WatcherError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let backend = if config.use_polling {
            Backend::Polling(Self::start_polling(&root, config, tx).await)
        } else {
            let translator = Arc::new(Translator::new(root.clone(), config.follow_symlinks));
            match Self::start_native(&root, config, Arc::clone(&translator), tx.clone()) {
                Ok(watcher) => {
                    // Seeded after the watch is live so no file slips between the two.
                    if let Some(scan) = scan_blocking(root.clone(), config.follow_symlinks).await {
                        tracing::debug!(
                            "Using native watcher for {} ({} files)",
                            root.base().display(),
                            scan.files.len()
                        );
                        translator.seed(scan);
                    }
                    Backend::Native(watcher)
                }
                Err(e) => {
                    tracing::warn!(
                        "Native watcher failed for {}: {}, falling back to polling",
                        root.base().display(),
                        e
                    );
                    Backend::Polling(Self::start_polling(&root, config, tx).await)
                }
            }
        };

        Ok((
            Self {
                backend: Some(backend),
                root,
            },
            rx,
        ))
    }

    async fn start_polling(
        root: &WatchRoot,
        config: &WatchConfig,
        tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Poller {
        let options = PollOptions {
            interval: config.poll_interval,
            binary_interval: config.binary_poll_interval,
            follow_symlinks: config.follow_symlinks,
        };
        Poller::start(root.clone(), options, tx).await
    }

    fn start_native(
        root: &WatchRoot,
        config: &WatchConfig,
        translator: Arc<Translator>,
        tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<RecommendedWatcher, WatcherError> {
        let notify_config = Config::default()
            .with_follow_symlinks(config.follow_symlinks)
            .with_compare_contents(false);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for change in translator.translate(&event) {
                        if tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!("Native watch error: {}", e),
            },
            notify_config,
        )?;

        watcher
            .watch(root.base(), RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchPath {
                path: root.base().to_path_buf(),
                source: e,
            })?;
        Ok(watcher)
    }

    /// Backend in use, or `None` once closed.
    pub fn backend(&self) -> Option<BackendKind> {
        match self.backend.as_ref()? {
            Backend::Native(_) => Some(BackendKind::Native),
            Backend::Polling(_) => Some(BackendKind::Polling),
        }
    }

    /// Whether the backend is still delivering events.
    pub fn is_running(&self) -> bool {
        match &self.backend {
            Some(Backend::Native(_)) => true,
            Some(Backend::Polling(poller)) => poller.is_running(),
            None => false,
        }
    }

    /// Release the backend's OS resources. Safe to call repeatedly.
    pub fn close(&mut self) {
        match self.backend.take() {
            Some(Backend::Native(mut watcher)) => {
                if let Err(e) = watcher.unwatch(self.root.base()) {
                    tracing::warn!(
                        "Failed to release native watch on {}: {}",
                        self.root.base().display(),
                        e
                    );
                }
            }
            Some(Backend::Polling(poller)) => poller.stop(),
            None => {}
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Relative paths of the files the native backend knows about.
///
/// Native backends report a moved or deleted directory as one path, so this
/// index is what lets its files be reported one by one.
#[derive(Debug, Default)]
struct KnownFiles(BTreeSet<PathBuf>);

impl KnownFiles {
    fn insert(&mut self, path: PathBuf) {
        self.0.insert(path);
    }

    /// Forget `path` and everything below it, returning the files dropped.
    fn remove_tree(&mut self, path: &Path) -> Vec<PathBuf> {
        // Paths order component-wise, so a subtree is one contiguous range.
        let gone: Vec<PathBuf> = self
            .0
            .range::<Path, _>((Bound::Included(path), Bound::Unbounded))
            .take_while(|known| known.starts_with(path))
            .cloned()
            .collect();
        for known in &gone {
            self.0.remove(known);
        }
        gone
    }
}

enum EntryStat {
    File(SystemTime),
    Dir,
    Other,
}

/// Turns raw notify events into file-level change events.
struct Translator {
    root: WatchRoot,
    follow_symlinks: bool,
    known: Mutex<KnownFiles>,
}

impl Translator {
    fn new(root: WatchRoot, follow_symlinks: bool) -> Self {
        Self {
            root,
            follow_symlinks,
            known: Mutex::default(),
        }
    }

    /// Record the files already under the root without reporting them.
    fn seed(&self, scan: Scan) {
        let mut known = self.known.lock();
        for path in scan.files.into_keys() {
            known.insert(path);
        }
    }

    fn translate(&self, event: &Event) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();

        for absolute in &event.paths {
            let Some(relative) = self.root.relative(absolute) else {
                continue;
            };
            match event.kind {
                // Renames arrive per side; the side that no longer exists is the removal.
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    match stat_entry(absolute) {
                        Ok(EntryStat::File(mod_time)) => {
                            self.known.lock().insert(relative.clone());
                            changes.push(ChangeEvent::added(relative, mod_time));
                        }
                        Ok(EntryStat::Dir) => self.appeared(absolute, &mut changes),
                        Ok(EntryStat::Other) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            self.disappeared(&relative, false, &mut changes)
                        }
                        Err(e) => {
                            tracing::trace!(
                                "Skipping {:?} of {}: {}",
                                event.kind,
                                relative.display(),
                                e
                            );
                        }
                    }
                }
                EventKind::Modify(_) => match stat_entry(absolute) {
                    Ok(EntryStat::File(mod_time)) => {
                        self.known.lock().insert(relative.clone());
                        changes.push(ChangeEvent::changed(relative, mod_time));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        self.disappeared(&relative, false, &mut changes)
                    }
                    Err(e) => {
                        tracing::trace!("Skipping change of {}: {}", relative.display(), e);
                    }
                },
                EventKind::Remove(RemoveKind::File) => {
                    self.disappeared(&relative, true, &mut changes)
                }
                EventKind::Remove(_) => self.disappeared(&relative, false, &mut changes),
                EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
            }
        }

        changes
    }

    /// A directory showed up (created or moved in): report every file in it.
    fn appeared(&self, absolute: &Path, changes: &mut Vec<ChangeEvent>) {
        let scan = scan_dir(&self.root, absolute, self.follow_symlinks);
        let mut known = self.known.lock();
        for (relative, stat) in scan.files {
            known.insert(relative.clone());
            if let Some(mod_time) = stat.mod_time {
                changes.push(ChangeEvent::added(relative, mod_time));
            }
        }
    }

    /// A path is gone: report each known file at or below it.
    ///
    /// `is_file` marks paths the backend reported as files, which are removed
    /// even when they were never seen before.
    fn disappeared(&self, relative: &Path, is_file: bool, changes: &mut Vec<ChangeEvent>) {
        let gone = self.known.lock().remove_tree(relative);
        if gone.is_empty() && is_file {
            changes.push(ChangeEvent::removed(relative, None));
            return;
        }
        changes.extend(gone.into_iter().map(|path| ChangeEvent::removed(path, None)));
    }
}

fn stat_entry(absolute: &Path) -> std::io::Result<EntryStat> {
    let metadata = std::fs::metadata(absolute)?;
    if metadata.is_file() {
        Ok(EntryStat::File(metadata.modified()?))
    } else if metadata.is_dir() {
        Ok(EntryStat::Dir)
    } else {
        Ok(EntryStat::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::event::ChangeKind;
    use notify::event::{CreateKind, DataChange, RenameMode};
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        Event {
            kind,
            paths,
            attrs: Default::default(),
        }
    }

    /// Translator for `dir` that already knows the files in it.
    fn seeded(dir: &Path) -> Translator {
        let root = WatchRoot::resolve(dir, false).unwrap();
        let translator = Translator::new(root.clone(), true);
        translator.seed(crate::watch::poller::scan(&root, true));
        translator
    }

    fn sorted(mut changes: Vec<ChangeEvent>) -> Vec<(ChangeKind, PathBuf)> {
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes.into_iter().map(|c| (c.kind, c.path)).collect()
    }

    #[test]
    fn test_known_files_remove_tree() {
        let mut known = KnownFiles::default();
        for path in ["d/a.md", "d/sub/b.md", "d.md", "d-other/c.md", "e.md"] {
            known.insert(PathBuf::from(path));
        }

        let mut gone = known.remove_tree(Path::new("d"));
        gone.sort();
        assert_eq!(gone, vec![PathBuf::from("d/a.md"), PathBuf::from("d/sub/b.md")]);
        assert_eq!(known.remove_tree(Path::new("e.md")), vec![PathBuf::from("e.md")]);
        assert_eq!(known.0.len(), 2);
    }

    #[test]
    fn test_translate_create() {
        let temp = tempdir().unwrap();
        let translator = seeded(temp.path());
        let file = temp.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();

        let changes =
            translator.translate(&make_event(EventKind::Create(CreateKind::File), vec![file]));

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].path, PathBuf::from("a.txt"));
        assert!(changes[0].mod_time.is_some());
    }

    #[test]
    fn test_translate_modify_of_vanished_file_is_removal() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("gone.txt");
        std::fs::write(&file, "x").unwrap();
        let translator = seeded(temp.path());
        std::fs::remove_file(&file).unwrap();

        let changes = translator.translate(&make_event(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            vec![file],
        ));

        assert_eq!(sorted(changes), vec![(ChangeKind::Removed, PathBuf::from("gone.txt"))]);
    }

    #[test]
    fn test_translate_empty_directory_is_quiet() {
        let temp = tempdir().unwrap();
        let translator = seeded(temp.path());
        let dir = temp.path().join("notes");
        std::fs::create_dir(&dir).unwrap();

        let created =
            translator.translate(&make_event(EventKind::Create(CreateKind::Folder), vec![dir.clone()]));
        std::fs::remove_dir(&dir).unwrap();
        let removed =
            translator.translate(&make_event(EventKind::Remove(RemoveKind::Folder), vec![dir]));

        assert!(created.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_translate_directory_moved_in_reports_its_files() {
        let temp = tempdir().unwrap();
        let translator = seeded(temp.path());
        let dir = temp.path().join("batch");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::create_dir_all(dir.join(".cache")).unwrap();
        std::fs::write(dir.join("note.md"), "x").unwrap();
        std::fs::write(dir.join("nested/deep.md"), "x").unwrap();
        std::fs::write(dir.join(".cache/skip.md"), "x").unwrap();

        let changes = translator.translate(&make_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec![dir],
        ));

        assert_eq!(
            sorted(changes),
            vec![
                (ChangeKind::Added, PathBuf::from("batch/nested/deep.md")),
                (ChangeKind::Added, PathBuf::from("batch/note.md")),
            ]
        );
    }

    #[test]
    fn test_translate_directory_moved_out_reports_each_file() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("old");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("gone.md"), "x").unwrap();
        std::fs::write(dir.join("sub/also.md"), "x").unwrap();
        std::fs::write(temp.path().join("old.md"), "x").unwrap();
        let translator = seeded(temp.path());
        std::fs::remove_dir_all(&dir).unwrap();

        let changes = translator.translate(&make_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec![dir.clone()],
        ));
        assert_eq!(
            sorted(changes),
            vec![
                (ChangeKind::Removed, PathBuf::from("old/gone.md")),
                (ChangeKind::Removed, PathBuf::from("old/sub/also.md")),
            ]
        );

        // A second report for the same directory finds nothing left to remove.
        let again =
            translator.translate(&make_event(EventKind::Remove(RemoveKind::Folder), vec![dir]));
        assert!(again.is_empty());
    }

    #[test]
    fn test_translate_rename_both() {
        let temp = tempdir().unwrap();
        let from = temp.path().join("old.md");
        std::fs::write(&from, "x").unwrap();
        let translator = seeded(temp.path());
        let to = temp.path().join("new.md");
        std::fs::rename(&from, &to).unwrap();

        let changes = translator.translate(&make_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![from, to],
        ));

        assert_eq!(
            sorted(changes),
            vec![
                (ChangeKind::Added, PathBuf::from("new.md")),
                (ChangeKind::Removed, PathBuf::from("old.md")),
            ]
        );
    }

    #[test]
    fn test_translate_removed_file_unknown_to_index() {
        let temp = tempdir().unwrap();
        let translator = seeded(temp.path());

        let changes = translator.translate(&make_event(
            EventKind::Remove(RemoveKind::File),
            vec![temp.path().join("never-seen.md")],
        ));

        assert_eq!(sorted(changes), vec![(ChangeKind::Removed, PathBuf::from("never-seen.md"))]);
    }

    #[test]
    fn test_translate_skips_paths_outside_root() {
        let temp = tempdir().unwrap();
        let translator = seeded(temp.path());

        let changes = translator.translate(&make_event(
            EventKind::Remove(RemoveKind::File),
            vec![PathBuf::from("/somewhere/else.txt")],
        ));
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_polling_source_close_is_idempotent() {
        let temp = tempdir().unwrap();
        let root = WatchRoot::resolve(temp.path(), false).unwrap();
        let config = WatchConfig::new(temp.path())
            .with_polling(true)
            .with_poll_intervals(Duration::from_millis(20), Duration::from_millis(20));

        let (mut source, _rx) = EventSource::subscribe(root, &config).await.unwrap();
        assert_eq!(source.backend(), Some(BackendKind::Polling));
        assert!(source.is_running());

        source.close();
        source.close();
        assert!(!source.is_running());
        assert_eq!(source.backend(), None);
    }
}
