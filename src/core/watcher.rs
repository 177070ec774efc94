//! Task file watcher.
//!
//! Watches the directory holding the task file and calls back when the file
//! itself changes. Atomic replacements show up as a rename onto the file
//! name, so events are matched by name rather than by inode.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use tracing::{debug, info, warn};

/// How long the file must be quiet before a change is reported
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Poll interval for the stop signal
const STOP_POLL: Duration = Duration::from_millis(200);

/// Handle to a running watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher and wait for its thread to exit
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.task.await.context("task file watcher panicked")?;
        Ok(())
    }
}

/// Start watching `task_file`; `on_change` runs on a blocking thread
pub fn watch_task_file<F>(task_file: &Path, on_change: F) -> Result<WatchHandle>
where
    F: Fn() + Send + 'static,
{
    let file_name = task_file
        .file_name()
        .map(|n| n.to_os_string())
        .with_context(|| format!("task file path has no file name: {}", task_file.display()))?;
    let dir = match task_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (events_tx, events_rx) = mpsc::channel();
    let mut debouncer = new_debouncer(DEBOUNCE, events_tx).context("failed to create watcher")?;
    debouncer
        .watcher()
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    info!(path = %task_file.display(), "Watching task file for changes");

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let task = tokio::task::spawn_blocking(move || {
        // The debouncer stops watching when dropped
        let _debouncer = debouncer;
        run_watcher(&file_name, &events_rx, &stop_rx, on_change);
    });

    Ok(WatchHandle { stop_tx, task })
}

fn run_watcher<F: Fn()>(
    file_name: &OsString,
    events_rx: &mpsc::Receiver<notify_debouncer_mini::DebounceEventResult>,
    stop_rx: &mpsc::Receiver<()>,
    on_change: F,
) {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match events_rx.recv_timeout(STOP_POLL) {
            Ok(Ok(events)) => {
                let touched = events
                    .iter()
                    .any(|e| e.path.file_name() == Some(file_name.as_os_str()));
                if touched {
                    debug!("Task file change detected");
                    on_change();
                }
            }
            Ok(Err(e)) => warn!(error = ?e, "Task file watcher error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Task file watcher channel disconnected");
                break;
            }
        }
    }
    debug!("Task file watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_change_to_task_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");
        std::fs::write(&path, "{}").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = watch_task_file(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Give the watcher a moment to register
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, r#"{"tasks": []}"#).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(hits.load(Ordering::SeqCst) > 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_files_are_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");
        std::fs::write(&path, "{}").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = watch_task_file(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        handle.stop().await.unwrap();
    }
}
