//! Worker-side log of one run.
//!
//! The pipeline writes the decisions it takes on behalf of the task into
//! this log, and the log is stored next to the task's artifacts before the
//! run is resolved, so task authors can see why a run ended the way it did.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};

use super::artifacts::ArtifactStore;
use crate::engine::ArtifactReader;
use crate::queue::RunKey;

/// Artifact name the log is stored under.
pub const TASK_LOG_ARTIFACT: &str = "public/logs/task.log";

#[derive(Debug, Default)]
pub struct TaskLog {
    lines: Mutex<Vec<String>>,
    uploaded: AtomicBool,
}

impl TaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Appends a timestamped line.
    pub fn write(&self, message: impl AsRef<str>) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.lines()
            .push(format!("[worker {timestamp}] {}", message.as_ref()));
    }

    pub fn contents(&self) -> String {
        let mut text = self.lines().join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::SeqCst)
    }

    /// Stores the log as [`TASK_LOG_ARTIFACT`]. Only the first call stores
    /// anything; failures are logged and do not affect the run.
    pub async fn upload(&self, store: &dyn ArtifactStore, run: &RunKey) {
        if self.uploaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let contents = self.contents().into_bytes();
        let artifact = ArtifactReader::new(TASK_LOG_ARTIFACT, Cursor::new(contents));
        match store.put(run, TASK_LOG_ARTIFACT, artifact).await {
            Ok(bytes) => debug!(run = %run, bytes, "Task log stored"),
            Err(e) => warn!(run = %run, error = %e, "Failed to store task log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LocalArtifactStore;

    #[test]
    fn test_lines_are_timestamped() {
        let log = TaskLog::new();
        assert_eq!(log.contents(), "");

        log.write("Sandbox created");
        log.write(String::from("Resolving run as completed"));
        let contents = log.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[worker "));
        assert!(lines[0].ends_with("] Sandbox created"));
        assert!(contents.ends_with("completed\n"));
    }

    #[tokio::test]
    async fn test_upload_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let run = RunKey::new("task-1", 0);

        let log = TaskLog::new();
        log.write("first");
        log.upload(&store, &run).await;
        assert!(log.is_uploaded());

        log.write("second");
        log.upload(&store, &run).await;

        let path = store.path_for(&run, TASK_LOG_ARTIFACT).unwrap();
        let stored = std::fs::read_to_string(path).unwrap();
        assert!(stored.contains("first"));
        assert!(!stored.contains("second"));
    }
}
