//! Runs whose pipelines are still alive, with the sandbox each one holds.
//!
//! Pipelines register their sandbox here instead of owning the only handle,
//! so that a pipeline aborted at the shutdown timeout still leaves the
//! manager a sandbox to close before caches and the engine are disposed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::tasklog::TaskLog;
use crate::engine::Sandbox;
use crate::queue::{RunKey, Task};

pub(crate) struct ActiveRun {
    pub task: Task,
    pub log: Arc<TaskLog>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl ActiveRun {
    pub async fn close_sandbox(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            close(self.task.key(), sandbox).await;
        }
    }
}

async fn close(run: &RunKey, sandbox: Arc<dyn Sandbox>) {
    match sandbox.close().await {
        Ok(()) => debug!(run = %run, sandbox_id = sandbox.id(), "Sandbox closed"),
        Err(e) => warn!(run = %run, sandbox_id = sandbox.id(), error = %e, "Failed to close sandbox"),
    }
}

#[derive(Default)]
pub(crate) struct RunTable {
    runs: Mutex<HashMap<RunKey, ActiveRun>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunKey, ActiveRun>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts tracking `task` and returns its task log.
    pub fn insert(&self, task: &Task) -> Arc<TaskLog> {
        let log = Arc::new(TaskLog::new());
        self.runs().insert(
            task.key().clone(),
            ActiveRun {
                task: task.clone(),
                log: Arc::clone(&log),
                sandbox: None,
            },
        );
        log
    }

    pub fn set_sandbox(&self, run: &RunKey, sandbox: Arc<dyn Sandbox>) {
        if let Some(active) = self.runs().get_mut(run) {
            active.sandbox = Some(sandbox);
        }
    }

    /// Closes the sandbox of `run` unless it was already closed.
    pub async fn close_sandbox(&self, run: &RunKey) {
        let sandbox = self
            .runs()
            .get_mut(run)
            .and_then(|active| active.sandbox.take());
        if let Some(sandbox) = sandbox {
            close(run, sandbox).await;
        }
    }

    pub fn remove(&self, run: &RunKey) -> Option<ActiveRun> {
        self.runs().remove(run)
    }

    pub fn drain(&self) -> Vec<ActiveRun> {
        self.runs().drain().map(|(_, active)| active).collect()
    }

    pub fn open_sandboxes(&self) -> usize {
        self.runs().values().filter(|a| a.sandbox.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MockEngine, SandboxPayload, SandboxState};
    use crate::queue::{TaskDefinition, WorkerIdentity};
    use chrono::Utc;
    use serde_json::json;

    fn task(id: &str) -> Task {
        let worker = WorkerIdentity {
            provisioner_id: "local".to_string(),
            worker_type: "mock".to_string(),
            worker_group: "test".to_string(),
            worker_id: "w-1".to_string(),
        };
        Task::new(RunKey::new(id, 0), worker, TaskDefinition::default(), Utc::now())
    }

    async fn sandbox(engine: &MockEngine, task: &Task) -> Arc<dyn Sandbox> {
        let payload = SandboxPayload {
            start: json!({"function": "true"}),
            options: json!({}),
        };
        engine
            .new_sandbox(&payload, &task.sandbox_context())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_close_sandbox_once() {
        let engine = MockEngine::default();
        let table = RunTable::new();
        let task = task("a");
        table.insert(&task);

        let sandbox = sandbox(&engine, &task).await;
        table.set_sandbox(task.key(), Arc::clone(&sandbox));
        assert_eq!(table.open_sandboxes(), 1);

        table.close_sandbox(task.key()).await;
        assert_eq!(sandbox.state(), SandboxState::Closed);
        assert_eq!(table.open_sandboxes(), 0);
        table.close_sandbox(task.key()).await;

        assert!(table.remove(task.key()).is_some());
        assert!(table.drain().is_empty());
    }

    #[tokio::test]
    async fn test_drained_runs_keep_their_sandbox() {
        let engine = MockEngine::default();
        let table = RunTable::new();
        let first = task("a");
        let second = task("b");
        table.insert(&first).write("claimed");
        table.insert(&second);
        let sandbox = sandbox(&engine, &first).await;
        table.set_sandbox(first.key(), Arc::clone(&sandbox));

        let mut drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.drain().is_empty());
        for active in &mut drained {
            active.close_sandbox().await;
        }
        assert_eq!(sandbox.state(), SandboxState::Closed);
        let logged: Vec<String> = drained.iter().map(|a| a.log.contents()).collect();
        assert!(logged.iter().any(|text| text.contains("claimed")));
    }
}
