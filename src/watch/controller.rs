//! Watcher controller.
//!
//! Wires an [`EventSource`], the [`StabilityFilter`] and the shared
//! [`DedupCache`] into a pipeline task that forwards surviving changes to the
//! [`ConsumerSink`].
//!
//! ```text
//! EventSource ──► hidden/pattern filter ──► StabilityFilter ──► DedupCache ──► ConsumerSink
//!                                              │        ▲
//!                                              └─timers─┘
//! ```
//!
//! A [`WatcherHandle`] owns one running pipeline. Reconfiguration starts a
//! new handle before stopping the old one, so there is never a moment with
//! no watcher; changes seen by both during the overlap share a modification
//! time and are deduplicated.

use crate::sink::ConsumerSink;
use crate::watch::config::WatchConfig;
use crate::watch::dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY};
use crate::watch::error::WatcherError;
use crate::watch::event::{is_hidden, ChangeEvent};
use crate::watch::root::WatchRoot;
use crate::watch::source::{BackendKind, EventSource};
use crate::watch::stability::{StabilityFilter, StableWrite};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Starts, stops and reconfigures watchers for one consumer.
///
/// Every handle started by the same controller shares one dedup cache.
pub struct WatcherController {
    sink: Arc<dyn ConsumerSink>,
    dedup: Arc<DedupCache>,
    next_id: AtomicU64,
}

impl WatcherController {
    /// Create a controller forwarding to `sink` with the default cache size.
    pub fn new(sink: Arc<dyn ConsumerSink>) -> Self {
        WatcherControllerBuilder::new(sink).build()
    }

    /// The cache shared by this controller's watchers.
    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Start a watcher for `config`.
    ///
    /// Fails if the configuration is invalid or the root is not an accessible
    /// directory. Files already present are not reported.
    pub async fn start(&self, config: WatchConfig) -> Result<WatcherHandle, WatcherError> {
        config.validate()?;
        let root = WatchRoot::resolve(&config.root, config.disable_globbing)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (source, events) = EventSource::subscribe(root.clone(), &config).await?;
        let (stability, ready) = StabilityFilter::new(config.stability(), root.base().to_path_buf());

        let pipeline = tokio::spawn(run_pipeline(
            id,
            root,
            events,
            ready,
            stability.clone(),
            Arc::clone(&self.dedup),
            Arc::clone(&self.sink),
        ));

        tracing::info!(
            "Watcher {} started on {} ({:?}, awaitWriteFinish={})",
            id,
            config.root.display(),
            source.backend(),
            stability.is_enabled()
        );

        Ok(WatcherHandle {
            id,
            config: Arc::new(config),
            source: Some(source),
            stability,
            pipeline: Some(pipeline),
        })
    }

    /// Stop a watcher. Stopping an already stopped handle does nothing.
    pub fn stop(&self, handle: &mut WatcherHandle) {
        handle.stop();
    }

    /// Replace the running watcher with one built from `config`.
    ///
    /// The new watcher is started first; only once it is running is the old
    /// one stopped. If the new watcher fails to start, `handle` is left
    /// untouched and still running.
    pub async fn reconfigure(
        &self,
        handle: &mut WatcherHandle,
        config: WatchConfig,
    ) -> Result<(), WatcherError> {
        let replacement = match self.start(config).await {
            Ok(replacement) => replacement,
            Err(e) => {
                tracing::warn!(
                    "Reconfiguration failed, watcher {} stays active: {}",
                    handle.id,
                    e
                );
                return Err(e);
            }
        };

        let mut old = std::mem::replace(handle, replacement);
        old.stop();
        tracing::info!("Watcher {} replaced by {}", old.id, handle.id);
        Ok(())
    }
}

/// Builder for [`WatcherController`].
pub struct WatcherControllerBuilder {
    sink: Arc<dyn ConsumerSink>,
    dedup_capacity: usize,
}

impl WatcherControllerBuilder {
    /// Builder for a controller forwarding to `sink`.
    pub fn new(sink: Arc<dyn ConsumerSink>) -> Self {
        Self {
            sink,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }

    /// Maximum number of paths remembered for deduplication.
    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    /// Create the controller and its dedup cache.
    pub fn build(self) -> WatcherController {
        WatcherController {
            sink: self.sink,
            dedup: Arc::new(DedupCache::new(self.dedup_capacity)),
            next_id: AtomicU64::new(0),
        }
    }
}

/// A running watcher. Dropping the handle stops it.
pub struct WatcherHandle {
    id: u64,
    config: Arc<WatchConfig>,
    source: Option<EventSource>,
    stability: StabilityFilter,
    pipeline: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Identifier used in log lines, unique per controller.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Configuration this watcher was started with.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Backend in use, or `None` once stopped.
    pub fn backend(&self) -> Option<BackendKind> {
        self.source.as_ref().and_then(EventSource::backend)
    }

    /// Whether the event source and pipeline are both still alive.
    pub fn is_running(&self) -> bool {
        self.source.as_ref().is_some_and(EventSource::is_running)
            && self.pipeline.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Writes waiting for the stability threshold.
    pub fn pending_writes(&self) -> usize {
        self.stability.pending_count()
    }

    /// Release the event source, pending stability timers and the pipeline.
    pub fn stop(&mut self) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        source.close();
        self.stability.cancel_all();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        tracing::info!("Watcher {} closed", self.id);
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_pipeline(
    id: u64,
    root: WatchRoot,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    mut ready: mpsc::UnboundedReceiver<StableWrite>,
    stability: StabilityFilter,
    dedup: Arc<DedupCache>,
    sink: Arc<dyn ConsumerSink>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if is_hidden(&event.path) || !root.matches(&event.path) {
                    tracing::trace!("Watcher {} ignoring {}", id, event.path.display());
                } else if let Some(event) = stability.submit(event) {
                    forward(id, event, &dedup, sink.as_ref());
                }
            }
            Some(write) = ready.recv() => {
                if let Some(event) = stability.take_ready(write) {
                    forward(id, event, &dedup, sink.as_ref());
                }
            }
            else => break,
        }
    }
    tracing::debug!("Watcher {} pipeline finished", id);
}

/// Dedup-check an event and hand it to the sink, swallowing sink failures.
fn forward(id: u64, event: ChangeEvent, dedup: &DedupCache, sink: &dyn ConsumerSink) {
    if !dedup.admit(&event) {
        tracing::debug!(
            "Watcher {} suppressed duplicate {} {}",
            id,
            event.kind,
            event.path.display()
        );
        return;
    }

    tracing::trace!("Watcher {} forwarding {} {}", id, event.kind, event.path.display());
    match catch_unwind(AssertUnwindSafe(|| sink.notify(event.kind, &event.path))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(
            "Dropped {} {}: {}",
            event.kind,
            event.path.display(),
            e
        ),
        Err(_) => tracing::warn!(
            "Consumer panicked handling {} {}",
            event.kind,
            event.path.display()
        ),
    }
}
