//! Per-target tailing task: the file lifecycle state machine that turns
//! filesystem events into hub publishes.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::stream::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::events::{FileEvents, FsEvent, WatchTarget};
use crate::hub::{HubError, LogHub};

const READ_CHUNK: usize = 8 * 1024;

/// Accumulates raw bytes and yields complete lines, retaining the trailing
/// partial line (as bytes, so a UTF-8 sequence split across reads survives)
/// until its newline arrives. Decoding is lossy per completed line.
#[derive(Debug, Default)]
pub(crate) struct LineBuf {
    partial: Vec<u8>,
}

impl LineBuf {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.partial.drain(..=idx).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }
}

enum TailState {
    /// No file is being read. `interrupted` marks that a previously tailed
    /// file went away, so the next creation also announces resumption.
    NonExistent { interrupted: bool },
    /// Actively reading `path` through an exclusively held handle.
    Tailing {
        file: File,
        path: PathBuf,
        offset: u64,
        partial: LineBuf,
    },
}

/// The per-target state machine. One instance per registered target, driven
/// by its own [`FileEvents`] stream on its own task; publishes into the hub
/// are this task's only side channel.
struct Tailer {
    /// Hub key: the absolutized file path, or the pattern path.
    key: PathBuf,
    hub: Arc<LogHub>,
    state: TailState,
}

/// Controls a spawned tailer task.
pub(crate) struct TailerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TailerHandle {
    /// Signals the task and waits for it to finish. After this returns the
    /// tailer publishes nothing further and its read handle is released.
    pub(crate) async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Attaches to `key`'s target and spawns its tailing task. Attaching
/// happens before the task starts, so content appended right after this
/// returns is never mistaken for history.
pub(crate) async fn spawn(key: PathBuf, hub: Arc<LogHub>, mut events: FileEvents) -> TailerHandle {
    let (tx, rx) = oneshot::channel();
    let mut tailer = Tailer {
        key,
        hub,
        state: TailState::NonExistent { interrupted: false },
    };
    tailer.attach_initial(&mut events).await;
    let task = tokio::spawn(tailer.run(events, rx));
    TailerHandle {
        shutdown: Some(tx),
        task,
    }
}

impl Tailer {
    async fn run(mut self, mut events: FileEvents, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                maybe_event = events.next() => match maybe_event {
                    Some(event) => self.handle(event, &mut events).await,
                    None => break,
                },
            }
        }
        tracing::debug!(path = %self.key.display(), "tailer stopped");
    }

    /// Attaches to a file that already exists at registration time. The
    /// handle seeks to the end: history is never replayed into the live
    /// feed, late subscribers get it from the buffer snapshot instead.
    async fn attach_initial(&mut self, events: &mut FileEvents) {
        let existing = match events.target().clone() {
            WatchTarget::File(path) if path.is_file() => Some(path),
            WatchTarget::File(_) => None,
            WatchTarget::Pattern { dir, pattern } => {
                let found = newest_match(&dir, &pattern).await;
                if let Some(path) = &found {
                    tracing::info!(
                        pattern = %self.key.display(),
                        file = %path.display(),
                        "initial pattern match",
                    );
                }
                found
            }
        };

        if let Some(path) = existing {
            self.open(path, events, true).await;
        }
    }

    async fn handle(&mut self, event: FsEvent, events: &mut FileEvents) {
        match event {
            FsEvent::Created(path) => self.on_created(path, events).await,
            FsEvent::Modified(path) => self.on_modified(path, events).await,
            FsEvent::Removed(path) => self.on_removed(path, events).await,
        }
    }

    async fn on_created(&mut self, path: PathBuf, events: &mut FileEvents) {
        match &self.state {
            TailState::NonExistent { interrupted } => {
                let interrupted = *interrupted;
                // Fresh creation is read from offset 0: everything the file
                // holds by the time of the event is new content.
                if !self.open(path, events, false).await {
                    return;
                }
                self.publish(self.hub.publish_file_created(&self.key), "file_created");
                if interrupted {
                    self.publish(self.hub.publish_stream_resumed(&self.key), "stream_resumed");
                }
                self.read_new().await;
            }
            TailState::Tailing { path: current, .. } => {
                if path == *current {
                    // Same path, new identity: atomic replace.
                    self.reopen_from_start(path, events, "file replaced").await;
                } else {
                    // Pattern target: a newer matching file takes over.
                    let reason = format!(
                        "switching from {} to {}",
                        display_name(current),
                        display_name(&path),
                    );
                    self.reopen_from_start(path, events, &reason).await;
                }
            }
        }
    }

    async fn on_modified(&mut self, path: PathBuf, events: &mut FileEvents) {
        match &self.state {
            TailState::NonExistent { .. } => {
                // Some backends report the appearance of a pending file as a
                // bare modify; treat it as creation once the file is there.
                if path.is_file() {
                    self.on_created(path, events).await;
                }
            }
            TailState::Tailing {
                path: current,
                offset,
                ..
            } => {
                if path != *current {
                    return;
                }
                let offset = *offset;
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() < offset => {
                        // Shrunk beneath the read offset: rotated or
                        // truncated in place, start over from the top.
                        self.reopen_from_start(path, events, "file truncated or rotated")
                            .await;
                    }
                    Ok(_) => self.read_new().await,
                    Err(e) => {
                        tracing::debug!(
                            path = %path.display(),
                            error = %e,
                            "transient metadata failure, retrying on next event",
                        );
                    }
                }
            }
        }
    }

    async fn on_removed(&mut self, path: PathBuf, events: &mut FileEvents) {
        let TailState::Tailing { path: current, .. } = &self.state else {
            return;
        };
        if path != *current {
            return;
        }

        // Drain whatever was written before the deletion reached us, then
        // drop the handle.
        self.read_new().await;
        self.state = TailState::NonExistent { interrupted: true };

        // Re-arm before announcing, so a recreation racing the announcement
        // cannot fall between unwatch and watch.
        if let Err(e) = events.watch_parent() {
            tracing::warn!(path = %self.key.display(), error = %e, "failed to re-arm directory watch");
        }

        tracing::info!(path = %self.key.display(), "tailed file went away");
        self.publish(self.hub.publish_file_deleted(&self.key), "file_deleted");
        self.publish(
            self.hub.publish_stream_interrupted(&self.key, "file deleted"),
            "stream_interrupted",
        );
    }

    /// Opens `path` and enters `Tailing`. With `seek_end` the offset starts
    /// at the current size, otherwise at 0. On failure the state machine
    /// stays in `NonExistent` (permission problems are announced, and
    /// retried on whatever creation event comes next).
    async fn open(&mut self, path: PathBuf, events: &mut FileEvents, seek_end: bool) -> bool {
        let interrupted = matches!(self.state, TailState::NonExistent { interrupted: true });

        match open_at(&path, seek_end).await {
            Ok((file, offset)) => {
                if let Err(e) = events.watch_file() {
                    tracing::warn!(path = %path.display(), error = %e, "failed to move watch onto file");
                }
                tracing::info!(
                    path = %self.key.display(),
                    file = %path.display(),
                    offset,
                    "tailing",
                );
                self.state = TailState::Tailing {
                    file,
                    path,
                    offset,
                    partial: LineBuf::default(),
                };
                true
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    tracing::warn!(path = %path.display(), error = %e, "open denied");
                    self.publish(
                        self.hub.publish_stream_interrupted(
                            &self.key,
                            &format!("permission denied: {}", e),
                        ),
                        "stream_interrupted",
                    );
                } else {
                    tracing::debug!(path = %path.display(), error = %e, "open failed");
                }
                self.state = TailState::NonExistent { interrupted };
                if let Err(e) = events.watch_parent() {
                    tracing::warn!(path = %self.key.display(), error = %e, "failed to re-arm directory watch");
                }
                false
            }
        }
    }

    /// Replaces the current handle with `path` read from offset 0,
    /// announcing the interruption and resumption around the swap.
    async fn reopen_from_start(&mut self, path: PathBuf, events: &mut FileEvents, reason: &str) {
        self.publish(
            self.hub.publish_stream_interrupted(&self.key, reason),
            "stream_interrupted",
        );
        self.state = TailState::NonExistent { interrupted: true };

        if self.open(path, events, false).await {
            self.publish(self.hub.publish_stream_resumed(&self.key), "stream_resumed");
            self.read_new().await;
        }
    }

    /// Reads everything appended since the saved offset, splits complete
    /// lines and publishes them. Read errors are transient by policy: log,
    /// keep state, retry on the next filesystem event.
    async fn read_new(&mut self) {
        let TailState::Tailing {
            file,
            path,
            offset,
            partial,
        } = &mut self.state
        else {
            return;
        };

        let mut chunk = [0u8; READ_CHUNK];
        let mut lines = Vec::new();
        loop {
            match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    *offset += n as u64;
                    lines.extend(partial.feed(&chunk[..n]));
                }
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %e,
                        "transient read failure, retrying on next event",
                    );
                    break;
                }
            }
        }

        if !lines.is_empty() {
            self.publish(self.hub.publish_content(&self.key, lines), "content");
        }
    }

    /// Publish failures mean the path raced an unregister; the task is about
    /// to be stopped anyway, so they are only worth a debug line.
    fn publish(&self, res: Result<(), HubError>, kind: &str) {
        if let Err(e) = res {
            tracing::debug!(path = %self.key.display(), event = kind, error = %e, "publish after unregister");
        }
    }
}

async fn open_at(path: &Path, seek_end: bool) -> io::Result<(File, u64)> {
    let mut file = File::open(path).await?;
    let offset = if seek_end {
        file.seek(SeekFrom::End(0)).await?
    } else {
        0
    };
    Ok((file, offset))
}

/// The most recently modified file in `dir` whose name matches `pattern`.
pub(crate) async fn newest_match(dir: &Path, pattern: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut best: Option<(SystemTime, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !crate::events::name_matches(pattern, name) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().map_or(true, |(t, _)| modified >= *t) {
            best = Some((modified, entry.path()));
        }
    }

    best.map(|(_, path)| path)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
