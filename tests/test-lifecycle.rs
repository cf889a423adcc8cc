use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use logfan::{LogSubscriber, MuxedLogs, SubscriberError, SubscriberId};

/// Records every delivery as a flat string for order assertions.
#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, ev: String) {
        self.0.lock().unwrap().push(ev);
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn content_lines(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("content:"))
            .flat_map(|e| e.split('|').map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

impl LogSubscriber for EventLog {
    fn on_content(&self, _path: &Path, lines: &[String]) -> Result<(), SubscriberError> {
        self.push(format!("content:{}", lines.join("|")));
        Ok(())
    }
    fn on_cleared(&self, _path: &Path) -> Result<(), SubscriberError> {
        self.push("cleared".into());
        Ok(())
    }
    fn on_stream_interrupted(&self, _path: &Path, reason: &str) -> Result<(), SubscriberError> {
        self.push(format!("interrupted:{}", reason));
        Ok(())
    }
    fn on_stream_resumed(&self, _path: &Path) -> Result<(), SubscriberError> {
        self.push("resumed".into());
        Ok(())
    }
    fn on_file_created(&self, _path: &Path) -> Result<(), SubscriberError> {
        self.push("created".into());
        Ok(())
    }
    fn on_file_deleted(&self, _path: &Path) -> Result<(), SubscriberError> {
        self.push("deleted".into());
        Ok(())
    }
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_until<F>(log: &EventLog, what: &str, pred: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let events = log.events();
        if pred(&events) {
            return events;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}; saw {:?}", what, events);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn append(path: &PathBuf, data: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .expect("failed to open for append");
    file.write_all(data).await.expect("failed to write");
    file.sync_all().await.expect("failed to sync");
}

#[tokio::test]
async fn create_then_content_in_order() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("missing.log");

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();

    let sub = Arc::new(EventLog::default());
    let history = logs.subscribe(&key, SubscriberId(1), sub.clone()).unwrap();
    assert!(history.is_empty());

    append(&logfile, b"a\nb\n").await;

    let events = wait_until(&sub, "creation and content", |evs| {
        evs.iter().any(|e| e.starts_with("content:")) && evs.len() >= 2
    })
    .await;

    // The creation event strictly precedes any content.
    assert_eq!(events[0], "created");
    wait_until(&sub, "both lines", |_| {
        sub.content_lines() == vec!["a".to_string(), "b".to_string()]
    })
    .await;
    // First-ever creation is not a resumption.
    assert!(!sub.events().contains(&"resumed".to_string()));

    logs.shutdown().await;
}

#[tokio::test]
async fn preexisting_content_is_not_replayed_live() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("existing.log");
    append(&logfile, b"history\n").await;

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();

    let sub = Arc::new(EventLog::default());
    let history = logs.subscribe(&key, SubscriberId(1), sub.clone()).unwrap();
    // Tailing starts at end-of-file, so nothing has been buffered.
    assert!(history.is_empty());

    append(&logfile, b"fresh\n").await;

    wait_until(&sub, "the appended line", |_| {
        sub.content_lines() == vec!["fresh".to_string()]
    })
    .await;

    logs.shutdown().await;
}

#[tokio::test]
async fn partial_line_held_until_newline() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("partial.log");
    append(&logfile, b"").await;

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();
    let sub = Arc::new(EventLog::default());
    logs.subscribe(&key, SubscriberId(1), sub.clone()).unwrap();

    append(&logfile, b"foo ").await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    // No newline yet, so nothing may be delivered.
    assert!(sub.content_lines().is_empty());

    append(&logfile, b"bar\n").await;
    wait_until(&sub, "the completed line", |_| {
        sub.content_lines() == vec!["foo bar".to_string()]
    })
    .await;

    logs.shutdown().await;
}

#[tokio::test]
async fn delete_then_recreate_resumes_from_start() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("cycle.log");
    append(&logfile, b"").await;

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();
    let sub = Arc::new(EventLog::default());
    logs.subscribe(&key, SubscriberId(1), sub.clone()).unwrap();

    append(&logfile, b"one\n").await;
    wait_until(&sub, "initial content", |_| {
        sub.content_lines() == vec!["one".to_string()]
    })
    .await;

    tokio::fs::remove_file(&logfile).await.unwrap();
    let events = wait_until(&sub, "deletion", |evs| {
        evs.contains(&"interrupted:file deleted".to_string())
    })
    .await;
    let deleted_at = events.iter().position(|e| e == "deleted").unwrap();
    let interrupted_at = events
        .iter()
        .position(|e| e == "interrupted:file deleted")
        .unwrap();
    assert!(deleted_at < interrupted_at);

    // Recreation announces creation and resumption, and content restarts
    // from offset 0 of the new file regardless of the old offset.
    append(&logfile, b"two\n").await;
    let events = wait_until(&sub, "resumption", |evs| {
        evs.contains(&"resumed".to_string())
            && sub.content_lines() == vec!["one".to_string(), "two".to_string()]
    })
    .await;
    let created_at = events.iter().rposition(|e| e == "created").unwrap();
    let resumed_at = events.iter().position(|e| e == "resumed").unwrap();
    assert!(interrupted_at < created_at);
    assert!(created_at < resumed_at);

    logs.shutdown().await;
}

#[tokio::test]
async fn two_subscribers_both_receive_each_line() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("shared.log");
    append(&logfile, b"").await;

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();

    let first = Arc::new(EventLog::default());
    let second = Arc::new(EventLog::default());
    logs.subscribe(&key, SubscriberId(1), first.clone()).unwrap();
    logs.subscribe(&key, SubscriberId(2), second.clone()).unwrap();

    append(&logfile, b"shared\n").await;

    wait_until(&first, "first subscriber's line", |_| {
        first.content_lines() == vec!["shared".to_string()]
    })
    .await;
    wait_until(&second, "second subscriber's line", |_| {
        second.content_lines() == vec!["shared".to_string()]
    })
    .await;

    logs.shutdown().await;
}

#[tokio::test]
async fn remove_stops_all_delivery() {
    init_tracing();
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("removed.log");
    append(&logfile, b"").await;

    let mut logs = MuxedLogs::new();
    let key = logs.add_file(&logfile).await.unwrap();
    let sub = Arc::new(EventLog::default());
    logs.subscribe(&key, SubscriberId(1), sub.clone()).unwrap();

    assert!(logs.remove(&key).await);

    // Filesystem activity after removal must not reach the subscriber.
    append(&logfile, b"late\n").await;
    tokio::fs::remove_file(&logfile).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(sub.events(), Vec::<String>::new());
}
