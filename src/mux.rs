//! Process-scoped entry point tying tailers to the hub.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::events::{self, FileEvents, WatchError, WatchTarget};
use crate::hub::{HubError, LogHub, LogSubscriber, SubscriberId};
use crate::tail::{self, TailerHandle};

/// Owns the hub plus one tailing task per registered target.
///
/// Constructed explicitly at startup and torn down with [`shutdown`]; there
/// is no hidden global instance. Dropping aborts any tasks still running.
///
/// Must be used within a Tokio runtime, since registering a target spawns
/// its tailing task.
///
/// [`shutdown`]: MuxedLogs::shutdown
pub struct MuxedLogs {
    hub: Arc<LogHub>,
    tailers: HashMap<PathBuf, TailerHandle>,
    buffer_capacity: usize,
}

impl MuxedLogs {
    /// Constructs an instance whose per-target history buffers hold
    /// [`crate::buffer::DEFAULT_CAPACITY`] lines.
    pub fn new() -> Self {
        Self::with_buffer_capacity(crate::buffer::DEFAULT_CAPACITY)
    }

    /// Constructs an instance retaining at most `capacity` history lines per
    /// target.
    pub fn with_buffer_capacity(capacity: usize) -> Self {
        MuxedLogs {
            hub: Arc::new(LogHub::new()),
            tailers: HashMap::new(),
            buffer_capacity: capacity,
        }
    }

    /// The underlying hub, e.g. for driving deliveries from a test stub.
    pub fn hub(&self) -> Arc<LogHub> {
        self.hub.clone()
    }

    /// Registers `path` for tailing, whether it currently exists or not, and
    /// returns the absolutized path used as the key for subscriptions.
    ///
    /// A file-name component containing `*` or `?` is treated as a wildcard
    /// pattern (see [`add_pattern`]). Idempotent per resolved path. Fails if
    /// the parent directory does not exist, the path names a directory, or
    /// no filesystem watch can be established.
    ///
    /// [`add_pattern`]: MuxedLogs::add_pattern
    pub async fn add_file(&mut self, path: impl Into<PathBuf>) -> io::Result<PathBuf> {
        let path = events::absolutify(path.into())?;
        if events::has_wildcard(&path) {
            return self.add_pattern(path).await;
        }
        if path.is_dir() {
            return Err(WatchError::InvalidTarget(path).into());
        }
        self.add_target(path.clone(), WatchTarget::File(path)).await
    }

    /// Registers a wildcard target: the newest file in the parent directory
    /// whose name matches the pattern (`*`/`?` in the file-name component)
    /// is tailed, switching when a newer match appears. The pattern path
    /// itself is the subscription key.
    pub async fn add_pattern(&mut self, path: impl Into<PathBuf>) -> io::Result<PathBuf> {
        let path = events::absolutify(path.into())?;
        if !events::has_wildcard(&path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a wildcard pattern: {}", path.display()),
            ));
        }
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::from(WatchError::InvalidTarget(path.clone())))?;
        let pattern = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::from(WatchError::InvalidTarget(path.clone())))?
            .to_string();

        self.add_target(path.clone(), WatchTarget::Pattern { dir, pattern })
            .await
    }

    async fn add_target(&mut self, key: PathBuf, target: WatchTarget) -> io::Result<PathBuf> {
        if self.tailers.contains_key(&key) {
            return Ok(key);
        }

        let events = FileEvents::new(target).map_err(io::Error::from)?;
        // Register before attaching so the tailer's first publishes land.
        self.hub
            .register_with_capacity(key.clone(), self.buffer_capacity);
        let handle = tail::spawn(key.clone(), self.hub.clone(), events).await;
        self.tailers.insert(key.clone(), handle);

        tracing::info!(path = %key.display(), "target added");
        Ok(key)
    }

    /// Stops tailing `path` and discards its buffer and subscriptions.
    /// The tailing task is fully stopped before the hub state is removed, so
    /// once this returns no further deliveries occur for the path. Returns
    /// whether the path was registered. Idempotent.
    pub async fn remove(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let key = events::absolutify(&path).unwrap_or(path);

        let Some(handle) = self.tailers.remove(&key) else {
            return false;
        };
        handle.stop().await;
        self.hub.unregister(&key);
        true
    }

    /// See [`LogHub::subscribe`].
    pub fn subscribe(
        &self,
        path: &Path,
        id: SubscriberId,
        subscriber: Arc<dyn LogSubscriber>,
    ) -> Result<Vec<String>, HubError> {
        self.hub.subscribe(path, id, subscriber)
    }

    /// See [`LogHub::unsubscribe`].
    pub fn unsubscribe(&self, path: &Path, id: SubscriberId) {
        self.hub.unsubscribe(path, id)
    }

    /// See [`LogHub::set_paused`].
    pub fn set_paused(&self, path: &Path, id: SubscriberId, paused: bool) -> Result<(), HubError> {
        self.hub.set_paused(path, id, paused)
    }

    /// See [`LogHub::clear`].
    pub fn clear(&self, path: &Path) -> Result<(), HubError> {
        self.hub.clear(path)
    }

    /// See [`LogHub::snapshot`].
    pub fn snapshot(&self, path: &Path) -> Result<Vec<String>, HubError> {
        self.hub.snapshot(path)
    }

    /// Paths currently being tailed.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.tailers.keys().cloned().collect()
    }

    /// Stops every tailer and discards all hub state.
    pub async fn shutdown(&mut self) {
        for (path, handle) in std::mem::take(&mut self.tailers) {
            handle.stop().await;
            self.hub.unregister(&path);
        }
    }
}

impl Default for MuxedLogs {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MuxedLogs {
    fn drop(&mut self) {
        for handle in self.tailers.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn add_file_is_idempotent() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("a.log");

        let mut mux = MuxedLogs::new();
        let key1 = mux.add_file(&path).await.unwrap();
        let key2 = mux.add_file(&path).await.unwrap();
        assert_eq!(key1, key2);
        assert_eq!(mux.paths().len(), 1);

        mux.shutdown().await;
    }

    #[tokio::test]
    async fn add_file_rejects_directory() {
        let tmp_dir = tempdir().expect("failed to create tempdir");

        let mut mux = MuxedLogs::new();
        let err = mux.add_file(tmp_dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn add_pattern_requires_wildcard() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("plain.log");

        let mut mux = MuxedLogs::new();
        let err = mux.add_pattern(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn wildcard_name_dispatches_to_pattern() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("app-*.log");

        let mut mux = MuxedLogs::new();
        let key = mux.add_file(&path).await.unwrap();
        assert!(mux.hub().is_registered(&key));

        mux.shutdown().await;
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let mut mux = MuxedLogs::new();
        assert!(!mux.remove("/definitely/not/registered.log").await);
    }

    #[tokio::test]
    async fn remove_discards_hub_state() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("a.log");

        let mut mux = MuxedLogs::new();
        let key = mux.add_file(&path).await.unwrap();
        assert!(mux.hub().is_registered(&key));

        assert!(mux.remove(&key).await);
        assert!(!mux.hub().is_registered(&key));
        assert!(!mux.remove(&key).await);
    }
}
