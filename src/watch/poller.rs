//! Stat-based polling backend.
//!
//! Walks the tree every poll interval and diffs it against the previous
//! snapshot. Binary files (by extension) are only re-compared every binary
//! interval. The first snapshot is taken before the poller starts and is never
//! reported, so only changes made after start produce events.

use crate::watch::event::{is_binary_path, is_hidden, ChangeEvent};
use crate::watch::root::WatchRoot;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use walkdir::WalkDir;

/// Polling cadence and walk options.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Walk period; text files are compared on every walk.
    pub interval: Duration,
    /// Minimum time between comparisons of a binary file.
    pub binary_interval: Duration,
    /// Descend into symlinked directories.
    pub follow_symlinks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStat {
    pub(crate) len: u64,
    pub(crate) mod_time: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    stat: FileStat,
    binary: bool,
    last_compared: Instant,
}

/// Result of one walk over the tree.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub(crate) files: HashMap<PathBuf, FileStat>,
    /// Relative directories that could not be read this cycle.
    pub(crate) unreadable: Vec<PathBuf>,
}

/// Tree snapshot and diffing, independent of any timer.
struct Snapshot {
    files: HashMap<PathBuf, Tracked>,
    binary_interval: Duration,
}

impl Snapshot {
    fn new(scan: Scan, binary_interval: Duration) -> Self {
        let now = Instant::now();
        let files = scan
            .files
            .into_iter()
            .map(|(path, stat)| {
                let binary = is_binary_path(&path);
                (
                    path,
                    Tracked {
                        stat,
                        binary,
                        last_compared: now,
                    },
                )
            })
            .collect();
        Self {
            files,
            binary_interval,
        }
    }

    /// Apply a fresh scan, returning the changes it reveals.
    fn diff(&mut self, scan: Scan, now: Instant) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let Scan {
            files: mut current,
            unreadable,
        } = scan;

        let binary_interval = self.binary_interval;
        self.files.retain(|path, tracked| {
            match current.remove(path) {
                Some(stat) => {
                    if tracked.binary && now.duration_since(tracked.last_compared) < binary_interval
                    {
                        return true;
                    }
                    tracked.last_compared = now;
                    if stat != tracked.stat {
                        tracked.stat = stat;
                        if let Some(mod_time) = stat.mod_time {
                            events.push(ChangeEvent::changed(path.clone(), mod_time));
                        }
                    }
                    true
                }
                // A directory we failed to read this cycle hides its files,
                // which does not mean they are gone.
                None if unreadable.iter().any(|dir| path.starts_with(dir)) => true,
                None => {
                    events.push(ChangeEvent::removed(path.clone(), tracked.stat.mod_time));
                    false
                }
            }
        });

        for (path, stat) in current {
            if let Some(mod_time) = stat.mod_time {
                events.push(ChangeEvent::added(path.clone(), mod_time));
            }
            let binary = is_binary_path(&path);
            self.files.insert(
                path,
                Tracked {
                    stat,
                    binary,
                    last_compared: now,
                },
            );
        }

        events
    }
}

/// Walk `root`, collecting visible files that match its pattern.
pub(crate) fn scan(root: &WatchRoot, follow_symlinks: bool) -> Scan {
    scan_dir(root, root.base(), follow_symlinks)
}

/// Like [`scan`], limited to the subtree at `dir` (an absolute path under the
/// root).
pub(crate) fn scan_dir(root: &WatchRoot, dir: &Path, follow_symlinks: bool) -> Scan {
    let mut result = Scan::default();
    let walker = WalkDir::new(dir)
        .follow_links(follow_symlinks)
        .into_iter()
        .filter_entry(|entry| {
            root.relative(entry.path())
                .map_or(true, |relative| !is_hidden(&relative))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry during poll: {}", e);
                if let Some(path) = e.path() {
                    let relative = root.relative(path).unwrap_or_default();
                    result.unreadable.push(relative);
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(relative) = root.relative(entry.path()) else {
            continue;
        };
        if !root.matches(&relative) {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) if metadata.is_file() => {
                result.files.insert(
                    relative,
                    FileStat {
                        len: metadata.len(),
                        mod_time: metadata.modified().ok(),
                    },
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Stat failed for {}: {}", relative.display(), e);
                result.unreadable.push(relative);
            }
        }
    }

    result
}

pub(crate) async fn scan_blocking(root: WatchRoot, follow_symlinks: bool) -> Option<Scan> {
    match tokio::task::spawn_blocking(move || scan(&root, follow_symlinks)).await {
        Ok(scan) => Some(scan),
        Err(e) => {
            tracing::warn!("Poll scan task failed: {}", e);
            None
        }
    }
}

/// A running polling loop. Dropping it stops the loop.
pub struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    /// Take the initial snapshot, then poll `root` on a background task.
    pub async fn start(
        root: WatchRoot,
        options: PollOptions,
        events_tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        let initial = scan_blocking(root.clone(), options.follow_symlinks)
            .await
            .unwrap_or_default();
        tracing::debug!(
            "Polling {} ({} files, interval {:?}, binary interval {:?})",
            root.base().display(),
            initial.files.len(),
            options.interval,
            options.binary_interval
        );
        let snapshot = Snapshot::new(initial, options.binary_interval);
        let task = tokio::spawn(poll_loop(root, options, snapshot, events_tx));
        Self { task }
    }

    /// Whether the polling task is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop polling. Safe to call more than once.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    root: WatchRoot,
    options: PollOptions,
    mut snapshot: Snapshot,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
) {
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial snapshot covers it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(scan) = scan_blocking(root.clone(), options.follow_symlinks).await else {
            continue;
        };
        for event in snapshot.diff(scan, Instant::now()) {
            if events_tx.send(event).is_err() {
                tracing::debug!(
                    "Event receiver closed, stopping poller for {}",
                    root.base().display()
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::event::ChangeKind;
    use tempfile::tempdir;

    fn at(secs: u64) -> Option<SystemTime> {
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn scan_of(files: &[(&str, u64, u64)]) -> Scan {
        Scan {
            files: files
                .iter()
                .map(|(path, len, secs)| {
                    (
                        PathBuf::from(path),
                        FileStat {
                            len: *len,
                            mod_time: at(*secs),
                        },
                    )
                })
                .collect(),
            unreadable: Vec::new(),
        }
    }

    fn kinds(mut events: Vec<ChangeEvent>) -> Vec<(ChangeKind, PathBuf)> {
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events.into_iter().map(|e| (e.kind, e.path)).collect()
    }

    #[test]
    fn test_diff_detects_add_change_remove() {
        let mut snapshot = Snapshot::new(
            scan_of(&[("a.txt", 1, 10), ("b.txt", 1, 10)]),
            Duration::from_millis(300),
        );

        let events = snapshot.diff(
            scan_of(&[("a.txt", 2, 11), ("c.txt", 1, 12)]),
            Instant::now(),
        );

        assert_eq!(
            kinds(events),
            vec![
                (ChangeKind::Changed, PathBuf::from("a.txt")),
                (ChangeKind::Removed, PathBuf::from("b.txt")),
                (ChangeKind::Added, PathBuf::from("c.txt")),
            ]
        );
    }

    #[test]
    fn test_diff_unchanged_tree_is_quiet() {
        let mut snapshot = Snapshot::new(scan_of(&[("a.txt", 1, 10)]), Duration::from_millis(300));
        assert!(snapshot
            .diff(scan_of(&[("a.txt", 1, 10)]), Instant::now())
            .is_empty());
    }

    #[test]
    fn test_removed_event_carries_last_mtime() {
        let mut snapshot = Snapshot::new(scan_of(&[("a.txt", 1, 10)]), Duration::from_millis(300));
        let events = snapshot.diff(scan_of(&[]), Instant::now());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mod_time, at(10));
    }

    #[test]
    fn test_binary_files_compared_on_binary_interval() {
        let start = Instant::now();
        let mut snapshot = Snapshot::new(scan_of(&[("img.png", 1, 10)]), Duration::from_secs(60));

        let early = snapshot.diff(scan_of(&[("img.png", 2, 11)]), start);
        assert!(early.is_empty());

        let late = snapshot.diff(
            scan_of(&[("img.png", 2, 11)]),
            start + Duration::from_secs(61),
        );
        assert_eq!(kinds(late), vec![(ChangeKind::Changed, PathBuf::from("img.png"))]);
    }

    #[test]
    fn test_unreadable_dir_does_not_report_removals() {
        let mut snapshot = Snapshot::new(
            scan_of(&[("locked/a.txt", 1, 10), ("b.txt", 1, 10)]),
            Duration::from_millis(300),
        );
        let mut scan = scan_of(&[("b.txt", 1, 10)]);
        scan.unreadable.push(PathBuf::from("locked"));

        assert!(snapshot.diff(scan, Instant::now()).is_empty());
    }

    #[test]
    fn test_scan_skips_hidden_and_unmatched() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join(".obsidian")).unwrap();
        std::fs::create_dir_all(temp.path().join("notes")).unwrap();
        std::fs::write(temp.path().join(".obsidian/workspace.json"), "{}").unwrap();
        std::fs::write(temp.path().join(".hidden.md"), "x").unwrap();
        std::fs::write(temp.path().join("notes/today.md"), "x").unwrap();
        std::fs::write(temp.path().join("notes/photo.png"), "x").unwrap();

        let root = WatchRoot::resolve(&temp.path().join("**/*.md"), false).unwrap();
        let result = scan(&root, true);

        let mut files: Vec<_> = result.files.into_keys().collect();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("notes/today.md")]);
    }

    #[cfg(unix)]
    fn linked_vault() -> (tempfile::TempDir, tempfile::TempDir) {
        let vault = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("shared.md"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), vault.path().join("linked")).unwrap();
        (vault, outside)
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_follows_symlinked_dirs_when_enabled() {
        let (vault, _outside) = linked_vault();
        let root = WatchRoot::resolve(vault.path(), false).unwrap();

        let followed: Vec<_> = scan(&root, true).files.into_keys().collect();
        let unfollowed: Vec<_> = scan(&root, false).files.into_keys().collect();

        assert_eq!(followed, vec![PathBuf::from("linked/shared.md")]);
        assert!(unfollowed.is_empty());
    }

    #[cfg(unix)]
    async fn change_through_link(follow_symlinks: bool) -> Option<ChangeEvent> {
        let (vault, outside) = linked_vault();
        let root = WatchRoot::resolve(vault.path(), false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = PollOptions {
            interval: Duration::from_millis(20),
            binary_interval: Duration::from_millis(20),
            follow_symlinks,
        };
        let poller = Poller::start(root, options, tx).await;

        std::fs::write(outside.path().join("new.md"), "y").unwrap();
        let received = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten();
        poller.stop();
        received
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poller_reports_changes_through_followed_symlink() {
        let event = change_through_link(true).await.unwrap();
        assert_eq!(event.kind, ChangeKind::Added);
        assert_eq!(event.path, PathBuf::from("linked/new.md"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poller_ignores_symlinked_dirs_when_not_following() {
        assert!(change_through_link(false).await.is_none());
    }

    #[tokio::test]
    async fn test_poller_ignores_initial_tree() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("existing.txt"), "x").unwrap();
        let root = WatchRoot::resolve(temp.path(), false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let poller = Poller::start(
            root,
            PollOptions {
                interval: Duration::from_millis(20),
                binary_interval: Duration::from_millis(20),
                follow_symlinks: true,
            },
            tx,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(temp.path().join("new.txt"), "y").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Added);
        assert_eq!(event.path, PathBuf::from("new.txt"));

        poller.stop();
    }
}
