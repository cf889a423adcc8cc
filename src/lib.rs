//! A library providing multiplexed tailing for (namely log) files, with a
//! bounded replayable history and fan-out delivery to many subscribers.
//!
//! Each registered path is tailed by its own task (driven by
//! [`notify`](https://crates.io/crates/notify)) that survives creation,
//! deletion, truncation and recreation of the underlying file. New content
//! flows through a central hub, which buffers the most recent lines and
//! republishes every event to the path's subscribers, so a file is read
//! once no matter how many consumers are attached. Subscribers can be paused
//! individually; content published meanwhile is flushed to them on resume.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use logfan::{LogSubscriber, MuxedLogs, SubscriberError, SubscriberId};
//!
//! struct Printer;
//!
//! impl LogSubscriber for Printer {
//!     fn on_content(&self, path: &Path, lines: &[String]) -> Result<(), SubscriberError> {
//!         for line in lines {
//!             println!("({}) {}", path.display(), line);
//!         }
//!         Ok(())
//!     }
//!     fn on_cleared(&self, _path: &Path) -> Result<(), SubscriberError> {
//!         Ok(())
//!     }
//!     fn on_stream_interrupted(&self, path: &Path, reason: &str) -> Result<(), SubscriberError> {
//!         println!("({}) -- interrupted: {}", path.display(), reason);
//!         Ok(())
//!     }
//!     fn on_stream_resumed(&self, path: &Path) -> Result<(), SubscriberError> {
//!         println!("({}) -- resumed", path.display());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut logs = MuxedLogs::new();
//!
//!     // Register some files to be tailed, whether they currently exist or not.
//!     let path = logs.add_file("some/file.log").await?;
//!     logs.add_file("/some/other/file.log").await?;
//!
//!     // Attach a consumer; it gets the buffered history up front and every
//!     // event from here on.
//!     let history = logs.subscribe(&path, SubscriberId(1), Arc::new(Printer)).unwrap();
//!     for line in history {
//!         println!("(history) {}", line);
//!     }
//!
//!     // ... the subscriber now receives lines as they are appended ...
//!     # logs.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Currently, logfan assumes that if a nonexistent file is added, its parent
//! does at least exist to register a directory watch with `notify`. This is
//! done for performance reasons and to simplify the pending-watch complexity
//! (such as limiting recursion and fs event spam).

mod buffer;
mod events;
mod hub;
mod mux;
mod tail;

pub use buffer::{LogBuffer, DEFAULT_CAPACITY};
pub use events::{FileEvents, FsEvent, WatchError, WatchTarget};
pub use hub::{HubError, LogHub, LogSubscriber, SubscriberError, SubscriberId};
pub use mux::MuxedLogs;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
