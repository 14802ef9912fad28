//! Duplicate-notification suppression keyed on modification time.
//!
//! Two detectors that observe the same write (a native event and a polling
//! pass, or an old and a new watcher overlapping during reconfiguration) see
//! the same modification time. The cache remembers the last forwarded state of
//! every path and drops events that carry nothing new.

use crate::watch::event::{ChangeEvent, ChangeKind};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Default number of paths remembered before LRU eviction.
pub const DEFAULT_DEDUP_CAPACITY: usize = 100_000;

/// Last forwarded state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupEntry {
    /// Last forwarded add/change carried this modification time.
    Modified(SystemTime),
    /// Last forwarded event was a removal.
    Removed,
}

/// Counters for monitoring the cache.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    /// Events allowed through.
    pub forwarded: u64,
    /// Events dropped as duplicates.
    pub suppressed: u64,
    /// Entries evicted by the LRU bound.
    pub evictions: u64,
}

struct Inner {
    entries: LruCache<PathBuf, DedupEntry>,
    stats: DedupStats,
}

/// Bounded path → last-forwarded-state cache.
///
/// Shared between every watcher a controller starts, so overlapping
/// watchers dedupe against each other. Each update holds the lock for a
/// single lookup-and-store.
pub struct DedupCache {
    inner: Mutex<Inner>,
    capacity: NonZeroUsize,
}

impl DedupCache {
    /// Create a cache remembering at most `capacity` paths.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: DedupStats::default(),
            }),
            capacity,
        }
    }

    /// Decide whether `event` should be forwarded, recording it if so.
    ///
    /// - add/change: dropped when the cached modification time is identical.
    /// - removal: forwarded unless the path is already recorded as removed,
    ///   so a removal is reported once however many detectors see it.
    /// - add/change without a modification time cannot be compared and is
    ///   always forwarded without touching the cache.
    pub fn admit(&self, event: &ChangeEvent) -> bool {
        let next = match (event.kind, event.mod_time) {
            (ChangeKind::Removed, _) => DedupEntry::Removed,
            (_, Some(mod_time)) => DedupEntry::Modified(mod_time),
            (_, None) => {
                self.inner.lock().stats.forwarded += 1;
                return true;
            }
        };

        let mut inner = self.inner.lock();
        if inner.entries.get(&event.path) == Some(&next) {
            inner.stats.suppressed += 1;
            return false;
        }

        if let Some((evicted, _)) = inner.entries.push(event.path.clone(), next) {
            if evicted != event.path {
                inner.stats.evictions += 1;
            }
        }
        inner.stats.forwarded += 1;
        true
    }

    /// Last forwarded modification time for `path`.
    pub fn last_modified(&self, path: &Path) -> Option<SystemTime> {
        match self.inner.lock().entries.peek(path) {
            Some(DedupEntry::Modified(mod_time)) => Some(*mod_time),
            _ => None,
        }
    }

    /// Cached state for `path`, without touching its recency.
    pub fn entry(&self, path: &Path) -> Option<DedupEntry> {
        self.inner.lock().entries.peek(path).copied()
    }

    /// Number of cached paths.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Maximum number of cached paths before the least recent is evicted.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Counters since creation or the last [`DedupCache::clear`].
    pub fn stats(&self) -> DedupStats {
        self.inner.lock().stats.clone()
    }

    /// Forget every path and reset the counters.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
