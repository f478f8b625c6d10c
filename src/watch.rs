//! Watch and notification types for reactive state updates.
//!
//! Backends publish one [`WatchEvent`] per key mutation through a
//! [`WatchSender`]. [`watch_tree`] turns those per-key events into a stream
//! of whole-subtree snapshots: consumers treat each snapshot as the state of
//! the subtree as of the read, never as an incremental diff.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::store::{dir_prefix, Entry, KvStore};

/// Default number of buffered per-key events before slow subscribers lag.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default number of buffered snapshots per tree watch.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 16;

/// Type of change that occurred to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created (did not exist before).
    Created,
    /// Key was updated (existed and value changed).
    Updated,
    /// Key was deleted.
    Deleted,
    /// The subscriber fell behind and missed events; state must be re-read.
    Resync,
}

/// A change to one key in the store.
///
/// Carries no values: tree watches answer every event by re-reading the
/// subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The key that changed.
    pub key: String,
    /// Type of change.
    pub event_type: EventType,
}

impl WatchEvent {
    fn new(key: impl Into<String>, event_type: EventType) -> Self {
        Self {
            key: key.into(),
            event_type,
        }
    }

    /// A key was written for the first time.
    pub fn created(key: impl Into<String>) -> Self {
        Self::new(key, EventType::Created)
    }

    /// An existing key was overwritten.
    pub fn updated(key: impl Into<String>) -> Self {
        Self::new(key, EventType::Updated)
    }

    /// A key was removed.
    pub fn deleted(key: impl Into<String>) -> Self {
        Self::new(key, EventType::Deleted)
    }

    /// Create a Resync marker for a watch pattern.
    pub fn resync(pattern: impl Into<String>) -> Self {
        Self::new(pattern, EventType::Resync)
    }
}

/// A stream of watch events for a specific pattern.
pub struct WatchStream {
    inner: BroadcastStream<WatchEvent>,
    pattern: String,
}

impl WatchStream {
    /// Create a new watch stream for the given pattern.
    pub fn new(receiver: broadcast::Receiver<WatchEvent>, pattern: impl Into<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Check if a key matches this stream's pattern.
    fn matches(&self, key: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == self.pattern,
        }
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.matches(&event.key) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    debug!(pattern = %self.pattern, missed, "watch subscriber lagged");
                    return Poll::Ready(Some(WatchEvent::resync(self.pattern.clone())));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Handle for sending watch events to subscribers.
#[derive(Clone)]
pub struct WatchSender {
    sender: broadcast::Sender<WatchEvent>,
}

impl WatchSender {
    /// Create a new watch sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    pub fn send(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self, pattern: impl Into<String>) -> WatchStream {
        WatchStream::new(self.sender.subscribe(), pattern)
    }
}

impl Default for WatchSender {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// A stream of authoritative snapshots of one key subtree.
///
/// Ends when the cancellation token passed to [`watch_tree`] fires or the
/// backing store stops publishing events.
pub struct TreeWatch {
    prefix: String,
    inner: ReceiverStream<Vec<Entry>>,
}

impl TreeWatch {
    /// The directory prefix this watch covers.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Stream for TreeWatch {
    type Item = Vec<Entry>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Watch every key under `prefix`, yielding a fresh snapshot per change.
///
/// The first snapshot is the subtree's current state. Subscription happens
/// before that first read, so no change between the two is lost.
pub fn watch_tree(
    store: Arc<dyn KvStore>,
    prefix: &str,
    cancel: CancellationToken,
    capacity: usize,
) -> Result<TreeWatch> {
    let prefix = dir_prefix(prefix);
    let mut events = store.watch(&format!("{}*", prefix))?;
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let task_prefix = prefix.clone();
    tokio::spawn(async move {
        if !send_snapshot(store.as_ref(), &task_prefix, &tx).await {
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(prefix = %task_prefix, "tree watch cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(event) => {
                        trace!(prefix = %task_prefix, key = %event.key, event_type = ?event.event_type, "tree changed");
                        if !send_snapshot(store.as_ref(), &task_prefix, &tx).await {
                            break;
                        }
                    }
                    None => {
                        debug!(prefix = %task_prefix, "store event channel closed");
                        break;
                    }
                },
            }
        }
    });

    Ok(TreeWatch {
        prefix,
        inner: ReceiverStream::new(rx),
    })
}

/// Read the subtree and forward it. Returns false once nobody is listening.
async fn send_snapshot(store: &dyn KvStore, prefix: &str, tx: &mpsc::Sender<Vec<Entry>>) -> bool {
    let entries = match store.list(prefix).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => {
            warn!(prefix = %prefix, error = %e, "failed to read tree snapshot");
            return !tx.is_closed();
        }
    };
    tx.send(entries).await.is_ok()
}
