//! Central fan-out of tailed content and stream lifecycle events to
//! subscribers, with a bounded replayable history per target.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::buffer::LogBuffer;

/// Error type a subscriber callback may fail with. Delivery failures are
/// caught and logged at the hub; they never propagate to the publisher.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-chosen identity of a subscriber registration.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriberId(pub u64);

impl From<u64> for SubscriberId {
    fn from(id: u64) -> Self {
        SubscriberId(id)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("path is not registered: {0}")]
    UnknownPath(PathBuf),
}

/// Receiver of tailed content and stream lifecycle notifications.
///
/// Callbacks are invoked synchronously on the publishing path and are
/// expected to hand work off quickly (e.g. queue into a UI event loop).
/// `on_file_created`/`on_file_deleted` have no-op defaults so that ordinary
/// consumers only deal with content and stream-level interruptions.
pub trait LogSubscriber: Send + Sync {
    /// New lines were read from the target.
    fn on_content(&self, path: &Path, lines: &[String]) -> Result<(), SubscriberError>;

    /// The target's buffered history was cleared.
    fn on_cleared(&self, path: &Path) -> Result<(), SubscriberError>;

    /// The live stream stopped (deletion, rotation, permissions, switch).
    fn on_stream_interrupted(&self, path: &Path, reason: &str) -> Result<(), SubscriberError>;

    /// The live stream is flowing again after an interruption.
    fn on_stream_resumed(&self, path: &Path) -> Result<(), SubscriberError>;

    /// The underlying file appeared.
    fn on_file_created(&self, _path: &Path) -> Result<(), SubscriberError> {
        Ok(())
    }

    /// The underlying file went away.
    fn on_file_deleted(&self, _path: &Path) -> Result<(), SubscriberError> {
        Ok(())
    }
}

struct SubscriberEntry {
    id: SubscriberId,
    subscriber: Arc<dyn LogSubscriber>,
    paused: bool,
    /// Content lines accumulated while paused, flushed on resume.
    pending: Vec<String>,
}

struct PathEntry {
    buffer: LogBuffer,
    /// Registration order; delivery iterates in this order.
    subscribers: Vec<SubscriberEntry>,
    /// Set by `unregister` so a publisher holding a stale handle cannot
    /// deliver after unregistration returned.
    closed: bool,
}

/// Non-content events fanned out alongside content. These are delivered to
/// paused subscribers too (pause gates content only) and are not recorded in
/// the buffer, so late subscribers see only the content snapshot.
#[derive(Clone, Copy, Debug)]
enum Lifecycle<'a> {
    FileCreated,
    FileDeleted,
    StreamInterrupted(&'a str),
    StreamResumed,
    Cleared,
}

impl Lifecycle<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Lifecycle::FileCreated => "file_created",
            Lifecycle::FileDeleted => "file_deleted",
            Lifecycle::StreamInterrupted(_) => "stream_interrupted",
            Lifecycle::StreamResumed => "stream_resumed",
            Lifecycle::Cleared => "cleared",
        }
    }
}

/// Registry mapping each tailed target to its history buffer and subscriber
/// set, and the single point through which tailers publish.
///
/// All buffer and subscription state is owned here; tailers and subscribers
/// only request mutation through the publish/subscribe operations. Every
/// operation locks exactly one path entry, so publishes and
/// subscription-state changes for one path are mutually exclusive (delivery
/// order equals publish order) while distinct paths proceed fully in
/// parallel.
pub struct LogHub {
    paths: RwLock<HashMap<PathBuf, Arc<Mutex<PathEntry>>>>,
}

impl LogHub {
    pub fn new() -> Self {
        LogHub {
            paths: RwLock::new(HashMap::new()),
        }
    }

    /// Starts tracking `path` with the default history capacity. Idempotent:
    /// an existing registration (and its buffer) is left untouched.
    pub fn register(&self, path: impl Into<PathBuf>) {
        self.register_with_capacity(path, crate::buffer::DEFAULT_CAPACITY);
    }

    /// Starts tracking `path`, retaining at most `capacity` history lines.
    pub fn register_with_capacity(&self, path: impl Into<PathBuf>, capacity: usize) {
        let path = path.into();
        let mut paths = self.paths.write();
        paths.entry(path).or_insert_with(|| {
            Arc::new(Mutex::new(PathEntry {
                buffer: LogBuffer::with_capacity(capacity),
                subscribers: Vec::new(),
                closed: false,
            }))
        });
    }

    /// Stops tracking `path`, discarding its buffer and all subscriptions.
    /// Idempotent. After this returns, any in-flight publish for the path
    /// delivers nothing.
    pub fn unregister(&self, path: &Path) {
        let removed = self.paths.write().remove(path);
        if let Some(entry) = removed {
            let mut entry = entry.lock();
            entry.closed = true;
            entry.subscribers.clear();
            entry.buffer.clear();
            tracing::info!(path = %path.display(), "unregistered");
        }
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.paths.read().contains_key(path)
    }

    fn entry(&self, path: &Path) -> Result<Arc<Mutex<PathEntry>>, HubError> {
        self.paths
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| HubError::UnknownPath(path.to_path_buf()))
    }

    /// Registers `subscriber` under `id` for `path` and returns the current
    /// history snapshot for immediate display. The subscriber starts active
    /// (not paused) and receives every subsequent publish exactly once, in
    /// publish order. Re-subscribing an existing id replaces the old
    /// registration.
    pub fn subscribe(
        &self,
        path: &Path,
        id: SubscriberId,
        subscriber: Arc<dyn LogSubscriber>,
    ) -> Result<Vec<String>, HubError> {
        let entry = self.entry(path)?;
        let mut entry = entry.lock();
        if entry.closed {
            return Err(HubError::UnknownPath(path.to_path_buf()));
        }
        entry.subscribers.retain(|s| s.id != id);
        entry.subscribers.push(SubscriberEntry {
            id,
            subscriber,
            paused: false,
            pending: Vec::new(),
        });
        tracing::debug!(path = %path.display(), subscriber = %id, "subscribed");
        Ok(entry.buffer.snapshot())
    }

    /// Removes the subscriber; its pending paused content is discarded.
    /// No-op for an unknown path or id.
    pub fn unsubscribe(&self, path: &Path, id: SubscriberId) {
        let Ok(entry) = self.entry(path) else {
            return;
        };
        let mut entry = entry.lock();
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.id != id);
        if entry.subscribers.len() < before {
            tracing::debug!(path = %path.display(), subscriber = %id, "unsubscribed");
        }
    }

    /// Pauses or resumes delivery for one subscriber. While paused, content
    /// accumulates in the subscriber's pending buffer; on resume the pending
    /// lines are flushed as a single `on_content` delivery in original order
    /// and live delivery continues. Other subscribers are unaffected.
    pub fn set_paused(&self, path: &Path, id: SubscriberId, paused: bool) -> Result<(), HubError> {
        let entry = self.entry(path)?;
        let mut entry = entry.lock();
        let Some(sub) = entry.subscribers.iter_mut().find(|s| s.id == id) else {
            tracing::debug!(path = %path.display(), subscriber = %id, "set_paused for unknown subscriber");
            return Ok(());
        };
        if sub.paused == paused {
            return Ok(());
        }
        sub.paused = paused;
        tracing::debug!(path = %path.display(), subscriber = %id, paused, "pause state changed");

        if !paused && !sub.pending.is_empty() {
            let pending = std::mem::take(&mut sub.pending);
            if let Err(e) = sub.subscriber.on_content(path, &pending) {
                tracing::warn!(
                    path = %path.display(),
                    subscriber = %id,
                    event = "content",
                    error = %e,
                    "subscriber delivery failed",
                );
            }
        }
        Ok(())
    }

    /// Current history snapshot without subscribing.
    pub fn snapshot(&self, path: &Path) -> Result<Vec<String>, HubError> {
        let entry = self.entry(path)?;
        let entry = entry.lock();
        if entry.closed {
            return Err(HubError::UnknownPath(path.to_path_buf()));
        }
        Ok(entry.buffer.snapshot())
    }

    /// Empties the history buffer and notifies every subscriber.
    pub fn clear(&self, path: &Path) -> Result<(), HubError> {
        let entry = self.entry(path)?;
        let mut entry = entry.lock();
        if entry.closed {
            return Err(HubError::UnknownPath(path.to_path_buf()));
        }
        entry.buffer.clear();
        Self::deliver_lifecycle(path, &mut entry, Lifecycle::Cleared);
        Ok(())
    }

    /// Appends `lines` to the history and delivers them to every subscriber
    /// in registration order. Active subscribers receive `on_content`
    /// immediately; paused ones accumulate the lines for their next resume.
    /// One subscriber's failure is logged and does not affect the rest.
    pub fn publish_content(&self, path: &Path, lines: Vec<String>) -> Result<(), HubError> {
        if lines.is_empty() {
            return Ok(());
        }
        let entry = self.entry(path)?;
        let mut entry = entry.lock();
        if entry.closed {
            return Err(HubError::UnknownPath(path.to_path_buf()));
        }
        entry.buffer.append(lines.iter().cloned());

        for sub in entry.subscribers.iter_mut() {
            if sub.paused {
                sub.pending.extend(lines.iter().cloned());
                continue;
            }
            if let Err(e) = sub.subscriber.on_content(path, &lines) {
                tracing::warn!(
                    path = %path.display(),
                    subscriber = %sub.id,
                    event = "content",
                    error = %e,
                    "subscriber delivery failed",
                );
            }
        }
        Ok(())
    }

    pub fn publish_file_created(&self, path: &Path) -> Result<(), HubError> {
        self.publish_lifecycle(path, Lifecycle::FileCreated)
    }

    pub fn publish_file_deleted(&self, path: &Path) -> Result<(), HubError> {
        self.publish_lifecycle(path, Lifecycle::FileDeleted)
    }

    pub fn publish_stream_interrupted(&self, path: &Path, reason: &str) -> Result<(), HubError> {
        self.publish_lifecycle(path, Lifecycle::StreamInterrupted(reason))
    }

    pub fn publish_stream_resumed(&self, path: &Path) -> Result<(), HubError> {
        self.publish_lifecycle(path, Lifecycle::StreamResumed)
    }

    fn publish_lifecycle(&self, path: &Path, event: Lifecycle<'_>) -> Result<(), HubError> {
        let entry = self.entry(path)?;
        let mut entry = entry.lock();
        if entry.closed {
            return Err(HubError::UnknownPath(path.to_path_buf()));
        }
        Self::deliver_lifecycle(path, &mut entry, event);
        Ok(())
    }

    fn deliver_lifecycle(path: &Path, entry: &mut PathEntry, event: Lifecycle<'_>) {
        for sub in entry.subscribers.iter() {
            let res = match event {
                Lifecycle::FileCreated => sub.subscriber.on_file_created(path),
                Lifecycle::FileDeleted => sub.subscriber.on_file_deleted(path),
                Lifecycle::StreamInterrupted(reason) => {
                    sub.subscriber.on_stream_interrupted(path, reason)
                }
                Lifecycle::StreamResumed => sub.subscriber.on_stream_resumed(path),
                Lifecycle::Cleared => sub.subscriber.on_cleared(path),
            };
            if let Err(e) = res {
                tracing::warn!(
                    path = %path.display(),
                    subscriber = %sub.id,
                    event = event.kind(),
                    error = %e,
                    "subscriber delivery failed",
                );
            }
        }
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths = self.paths.read();
        f.debug_struct("LogHub")
            .field("paths", &paths.keys().collect::<Vec<_>>())
            .finish()
    }
}
