//! Write-stability filter.
//!
//! Holds add/change events until the file's size and modification time stop
//! changing for the configured threshold, so half-written files are not
//! reported. Each pending path gets a timer task that re-stats the file every
//! poll interval. When the file has been quiet long enough the task reports a
//! [`StableWrite`], and the pipeline claims the pending event with
//! [`StabilityFilter::take_ready`].
//!
//! All decisions about a path (submit, removal, claim) are made by the single
//! pipeline task, so a removal processed before a claim always wins.

use crate::watch::config::StabilitySettings;
use crate::watch::event::{ChangeEvent, ChangeKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Notice from a timer task that a pending write is finished.
#[derive(Debug)]
pub struct StableWrite {
    /// Root-relative path of the settled file.
    pub path: PathBuf,
    generation: u64,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Unchanged for the threshold; carries the final modification time.
    Settled(Option<SystemTime>),
    /// The file disappeared while settling.
    Vanished,
}

struct PendingWrite {
    event: ChangeEvent,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Pending {
    writes: HashMap<PathBuf, PendingWrite>,
    next_generation: u64,
}

/// Buffers add/change events until their file is stable.
///
/// Cloning shares the same pending set.
#[derive(Clone)]
pub struct StabilityFilter {
    settings: Option<StabilitySettings>,
    base: PathBuf,
    pending: Arc<Mutex<Pending>>,
    ready_tx: mpsc::UnboundedSender<StableWrite>,
}

impl StabilityFilter {
    /// Create a filter for files under `base`.
    ///
    /// With `settings == None` every event passes straight through. The
    /// returned receiver yields notices for settled writes.
    pub fn new(
        settings: Option<StabilitySettings>,
        base: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<StableWrite>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                base,
                pending: Arc::new(Mutex::new(Pending::default())),
                ready_tx,
            },
            ready_rx,
        )
    }

    /// Whether events are held at all.
    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    /// Number of writes currently waiting to settle.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().writes.len()
    }

    /// Offer an event to the filter.
    ///
    /// Returns the event when it should be forwarded now. Returns `None` when
    /// it was buffered, or merged into an already pending write for the same
    /// path. A merged write keeps its original kind and waits the full
    /// threshold again.
    pub fn submit(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        let Some(settings) = self.settings else {
            return Some(event);
        };

        if event.kind == ChangeKind::Removed {
            if let Some(stale) = self.pending.lock().writes.remove(&event.path) {
                stale.timer.abort();
                tracing::trace!(
                    "Discarded pending {} for removed {}",
                    stale.event.kind,
                    event.path.display()
                );
            }
            return Some(event);
        }

        let mut pending = self.pending.lock();
        pending.next_generation += 1;
        let generation = pending.next_generation;
        let timer = tokio::spawn(await_stable(
            self.base.join(&event.path),
            event.path.clone(),
            generation,
            settings,
            self.ready_tx.clone(),
        ));

        if let Some(write) = pending.writes.get_mut(&event.path) {
            // Restart the wait: a notice already sent by the old timer predates
            // this write and must not release it.
            write.timer.abort();
            write.timer = timer;
            write.generation = generation;
            if event.mod_time.is_some() {
                write.event.mod_time = event.mod_time;
            }
            tracing::trace!("Write still settling: {}", event.path.display());
            return None;
        }

        tracing::trace!("Awaiting write finish: {}", event.path.display());
        pending.writes.insert(
            event.path.clone(),
            PendingWrite {
                event,
                generation,
                timer,
            },
        );
        None
    }

    /// Claim the event for a finished write.
    ///
    /// Returns `None` if the write was discarded or written to again after the
    /// timer fired, or if the file vanished while settling.
    pub fn take_ready(&self, ready: StableWrite) -> Option<ChangeEvent> {
        let mut pending = self.pending.lock();
        match pending.writes.get(&ready.path) {
            Some(write) if write.generation == ready.generation => {}
            _ => return None,
        }
        let write = pending.writes.remove(&ready.path)?;
        match ready.outcome {
            Outcome::Settled(mod_time) => {
                let mut event = write.event;
                if mod_time.is_some() {
                    event.mod_time = mod_time;
                }
                Some(event)
            }
            Outcome::Vanished => None,
        }
    }

    /// Cancel every pending write and its timer.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock();
        for (_, write) in pending.writes.drain() {
            write.timer.abort();
        }
    }
}

/// Timer task: poll the file until it has been unchanged for the threshold.
async fn await_stable(
    absolute: PathBuf,
    path: PathBuf,
    generation: u64,
    settings: StabilitySettings,
    ready_tx: mpsc::UnboundedSender<StableWrite>,
) {
    let mut last_seen: Option<(u64, Option<SystemTime>)> = None;
    let mut last_change = Instant::now();

    loop {
        tokio::time::sleep(settings.poll_interval).await;

        let metadata = match tokio::fs::metadata(&absolute).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The removal event that follows reports this path.
                tracing::trace!("Pending write vanished: {}", path.display());
                let _ = ready_tx.send(StableWrite {
                    path,
                    generation,
                    outcome: Outcome::Vanished,
                });
                return;
            }
            Err(e) => {
                tracing::debug!("Stat failed for pending {}: {}", path.display(), e);
                continue;
            }
        };

        let current = (metadata.len(), metadata.modified().ok());
        if last_seen != Some(current) {
            last_seen = Some(current);
            last_change = Instant::now();
            continue;
        }

        if last_change.elapsed() >= settings.threshold {
            let _ = ready_tx.send(StableWrite {
                path,
                generation,
                outcome: Outcome::Settled(current.1),
            });
            return;
        }
    }
}
