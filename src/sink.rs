//! Consumer sink contract.
//!
//! The watcher hands every surviving change to a [`ConsumerSink`] through a
//! single `notify(kind, path)` call. Delivery is best-effort: the watcher
//! logs and drops a notification the sink rejects, and keeps running.

use crate::watch::ChangeKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors a sink can report for a single notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Consumer is not available")]
    Unavailable,

    #[error("Consumer rejected notification: {0}")]
    Rejected(String),
}

/// The component interested in file changes (typically the host's file index).
pub trait ConsumerSink: Send + Sync {
    /// Handle one change. `path` is relative to the watch root.
    fn notify(&self, kind: ChangeKind, path: &Path) -> Result<(), SinkError>;
}

impl<T: ConsumerSink + ?Sized> ConsumerSink for Arc<T> {
    fn notify(&self, kind: ChangeKind, path: &Path) -> Result<(), SinkError> {
        (**self).notify(kind, path)
    }
}

/// A sink whose consumer may come and go. `None` reports `Unavailable`.
impl<T: ConsumerSink> ConsumerSink for Option<T> {
    fn notify(&self, kind: ChangeKind, path: &Path) -> Result<(), SinkError> {
        match self {
            Some(sink) => sink.notify(kind, path),
            None => Err(SinkError::Unavailable),
        }
    }
}

/// A notification as published by [`BroadcastSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// What happened to the file.
    pub kind: ChangeKind,
    /// Path relative to the watch root.
    pub path: PathBuf,
}

/// Publishes notifications on a broadcast channel.
///
/// Any number of listeners can subscribe. With no listener attached the sink
/// reports [`SinkError::Unavailable`].
#[derive(Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `buffer_size` notifications per listener.
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Attach a new listener. It only sees notifications sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ConsumerSink for BroadcastSink {
    fn notify(&self, kind: ChangeKind, path: &Path) -> Result<(), SinkError> {
        self.sender
            .send(Notification {
                kind,
                path: path.to_path_buf(),
            })
            .map(|_| ())
            .map_err(|_| SinkError::Unavailable)
    }
}
