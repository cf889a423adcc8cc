//! Everything related to watching a tailed target for creations,
//! modifications, deletions, etc.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors establishing or adjusting a filesystem watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Creation(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("target is not a tailable file: {0}")]
    InvalidTarget(PathBuf),
    #[error("parent directory does not exist for {0}")]
    MissingParent(PathBuf),
}

impl From<WatchError> for io::Error {
    fn from(err: WatchError) -> io::Error {
        match &err {
            WatchError::InvalidTarget(_) | WatchError::MissingParent(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}

/// A filesystem event reduced to what tailing cares about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FsEvent {
    /// The path appeared (created, or renamed into place).
    Created(PathBuf),
    /// The path's contents changed.
    Modified(PathBuf),
    /// The path went away (deleted, or renamed away).
    Removed(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Modified(p) | FsEvent::Removed(p) => p,
        }
    }
}

/// What a [`FileEvents`] instance is following.
#[derive(Clone, Debug)]
pub enum WatchTarget {
    /// A single file, present or not.
    File(PathBuf),
    /// Files in `dir` whose name matches `pattern` (`*`/`?`).
    Pattern { dir: PathBuf, pattern: String },
}

impl WatchTarget {
    pub fn dir(&self) -> &Path {
        match self {
            WatchTarget::File(path) => path.parent().unwrap_or_else(|| Path::new("/")),
            WatchTarget::Pattern { dir, .. } => dir,
        }
    }

    /// Whether an event for `path` concerns this target.
    fn is_relevant(&self, path: &Path) -> bool {
        match self {
            WatchTarget::File(target) => path == target,
            WatchTarget::Pattern { dir, pattern } => {
                path.parent() == Some(dir.as_path())
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| name_matches(pattern, n))
            }
        }
    }
}

enum WatchMode {
    /// Watching the target file itself (it exists and is being tailed).
    File,
    /// Watching the parent directory, waiting for the target to appear.
    Parent,
}

/// Filesystem event source for one tailed target.
///
/// Internally wraps a [`notify::RecommendedWatcher`] whose callback proxies
/// raw events into an unbounded channel, so the async side never blocks the
/// notify backend. Events are filtered down to the target and classified
/// into [`FsEvent`]s. A target that does not exist yet is observed through a
/// watch on its parent directory, which is the only way to catch its
/// creation; the parent itself must exist.
pub struct FileEvents {
    inner: RecommendedWatcher,
    target: WatchTarget,
    mode: WatchMode,
    pending: VecDeque<FsEvent>,
    event_stream: mpsc::UnboundedReceiver<Result<notify::Event, notify::Error>>,
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileEvents")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl FileEvents {
    /// Constructs an event source for `target`.
    ///
    /// A file target that currently exists is watched directly; otherwise
    /// its parent directory is watched. Pattern targets always watch the
    /// directory.
    pub fn new(target: WatchTarget) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The only way `send` can fail is if the receiver is dropped, and
        // `FileEvents` controls both; the result is discarded rather than
        // unwrapped so `Drop` ordering can never panic the callback.
        let inner = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(WatchError::Creation)?;

        let mut events = FileEvents {
            inner,
            target,
            mode: WatchMode::Parent,
            pending: VecDeque::new(),
            event_stream: rx,
        };

        match events.target.clone() {
            WatchTarget::File(path) if path.is_file() => {
                events.watch(&path, WatchMode::File)?;
            }
            target => {
                let dir = target.dir().to_path_buf();
                if !dir.is_dir() {
                    return Err(WatchError::MissingParent(dir));
                }
                events.watch(&dir, WatchMode::Parent)?;
            }
        }

        Ok(events)
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Moves the watch onto the target file itself, once a previously
    /// missing file exists. No-op for pattern targets, which stay on the
    /// directory for their whole life.
    pub fn watch_file(&mut self) -> Result<(), WatchError> {
        let WatchTarget::File(path) = self.target.clone() else {
            return Ok(());
        };
        if matches!(self.mode, WatchMode::File) {
            return Ok(());
        }
        // Arm the new watch before dropping the old one so no event can fall
        // between the two.
        let dir = self.target.dir().to_path_buf();
        self.watch(&path, WatchMode::File)?;
        self.unwatch(&dir);
        Ok(())
    }

    /// Re-arms the parent-directory watch after the target went away.
    pub fn watch_parent(&mut self) -> Result<(), WatchError> {
        if matches!(self.mode, WatchMode::Parent) {
            return Ok(());
        }
        let dir = self.target.dir().to_path_buf();
        self.watch(&dir, WatchMode::Parent)?;
        if let WatchTarget::File(path) = self.target.clone() {
            self.unwatch(&path);
        }
        Ok(())
    }

    fn watch(&mut self, path: &Path, mode: WatchMode) -> Result<(), WatchError> {
        self.inner
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })?;
        self.mode = mode;
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) {
        // The old watch may already be gone (most backends drop the watch
        // with the deleted file), so failure here is expected and harmless.
        if let Err(e) = self.inner.unwatch(path) {
            tracing::trace!(path = %path.display(), error = %e, "unwatch failed");
        }
    }

    /// Reduces a raw notify event to the target-relevant [`FsEvent`]s,
    /// queuing them for the stream.
    fn classify(&mut self, event: notify::Event) {
        for (idx, path) in event.paths.iter().enumerate() {
            if !self.target.is_relevant(path) {
                continue;
            }
            let classified = match &event.kind {
                // Windows reports `Any` for both creation and modification,
                // so those are tolerated alongside the precise kinds.
                EventKind::Create(CreateKind::File) => Some(FsEvent::Created(path.clone())),
                EventKind::Create(CreateKind::Any) if cfg!(target_os = "windows") => {
                    Some(FsEvent::Created(path.clone()))
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    Some(FsEvent::Created(path.clone()))
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    Some(FsEvent::Removed(path.clone()))
                }
                // paths = [from, to]
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                    if idx == 0 {
                        Some(FsEvent::Removed(path.clone()))
                    } else {
                        Some(FsEvent::Created(path.clone()))
                    }
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    Some(FsEvent::Modified(path.clone()))
                }
                EventKind::Remove(_) => Some(FsEvent::Removed(path.clone())),
                _ => None,
            };
            if let Some(ev) = classified {
                self.pending.push_back(ev);
            }
        }
    }
}

impl Stream for FileEvents {
    type Item = FsEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Poll::Ready(Some(ev));
            }
            match self.event_stream.poll_recv(cx) {
                Poll::Ready(Some(Ok(event))) => self.classify(event),
                Poll::Ready(Some(Err(e))) => {
                    // Backend hiccups are not actionable per-path; the next
                    // real event re-synchronizes the tailer.
                    tracing::debug!(watched = ?self.target, error = %e, "watch event error");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Resolves `path` to an absolute form without requiring the file itself to
/// exist: the parent is canonicalized when possible and the file name is
/// re-appended.
pub(crate) fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let parent = match path.parent() {
        None => std::env::current_dir()?,
        Some(p) if p == Path::new("") => std::env::current_dir()?,
        Some(p) => p.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "filename not found in path"))?
        .to_os_string();

    let parent = parent.canonicalize().unwrap_or(parent);

    Ok(parent.join(filename))
}

/// Shell-style file-name match supporting `*` (any run) and `?` (any single
/// character).
pub(crate) fn name_matches(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();

    // Iterative wildcard match with single-star backtracking.
    let (mut p, mut t) = (0, 0);
    let (mut star, mut star_t) = (None, 0);

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Whether a path's file-name component contains wildcard metacharacters.
pub(crate) fn has_wildcard(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains('*') || n.contains('?'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::StreamExt;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::fs::File;

    #[test]
    fn test_absolutify_keeps_filename() {
        let abs = absolutify("some-file.log").unwrap();
        assert!(abs.is_absolute());
        assert_eq!(abs.file_name().unwrap(), "some-file.log");
    }

    #[test]
    fn test_name_matches() {
        assert!(name_matches("app-*.log", "app-2024-01-01.log"));
        assert!(name_matches("app-*.log", "app-.log"));
        assert!(!name_matches("app-*.log", "app-1.txt"));
        assert!(name_matches("?.log", "a.log"));
        assert!(!name_matches("?.log", "ab.log"));
        assert!(name_matches("*", "anything"));
        assert!(!name_matches("app.log", "other.log"));
        assert!(name_matches("a*b*c", "a-x-b-y-c"));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("no-such-dir").join("foo.log");

        let res = FileEvents::new(WatchTarget::File(path));
        assert!(matches!(res, Err(WatchError::MissingParent(_))));
    }

    #[tokio::test]
    async fn test_pending_file_creation_event() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let file_path = tmp_dir.path().join("missing.log");

        let mut events =
            FileEvents::new(WatchTarget::File(file_path.clone())).expect("failed to create watch");

        let _file = File::create(&file_path)
            .await
            .expect("failed to create file");

        let ev = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("timed out waiting for create event")
            .expect("event stream ended");
        assert_eq!(ev, FsEvent::Created(file_path));
    }

    #[tokio::test]
    async fn test_irrelevant_siblings_filtered() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let file_path = tmp_dir.path().join("watched.log");
        let other_path = tmp_dir.path().join("other.log");

        let mut events =
            FileEvents::new(WatchTarget::File(file_path.clone())).expect("failed to create watch");

        let _other = File::create(&other_path)
            .await
            .expect("failed to create file");
        let _file = File::create(&file_path)
            .await
            .expect("failed to create file");

        // The sibling file's creation must not leak through.
        let ev = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("timed out waiting for create event")
            .expect("event stream ended");
        assert_eq!(ev, FsEvent::Created(file_path));
    }

    #[tokio::test]
    async fn test_pattern_target_matches_by_name() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let target = WatchTarget::Pattern {
            dir: tmp_dir.path().to_path_buf(),
            pattern: "app-*.log".to_string(),
        };
        let mut events = FileEvents::new(target).expect("failed to create watch");

        let miss = tmp_dir.path().join("noise.txt");
        let hit = tmp_dir.path().join("app-1.log");
        let _miss = File::create(&miss).await.expect("failed to create file");
        let _hit = File::create(&hit).await.expect("failed to create file");

        let ev = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("timed out waiting for create event")
            .expect("event stream ended");
        assert_eq!(ev, FsEvent::Created(hit));
    }
}
