//! Claimed task handle shared by a pipeline and the reclaim timer.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::client::{RunKey, TaskDefinition, WorkerIdentity};
use crate::engine::SandboxContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Claimed,
    Running,
    Resolved,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    taken_until: DateTime<Utc>,
}

#[derive(Debug)]
struct TaskInner {
    key: RunKey,
    worker: WorkerIdentity,
    definition: TaskDefinition,
    state: Mutex<TaskState>,
    claim_lost: CancellationToken,
}

/// A claimed run. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(
        key: RunKey,
        worker: WorkerIdentity,
        definition: TaskDefinition,
        taken_until: DateTime<Utc>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                key,
                worker,
                definition,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Claimed,
                    taken_until,
                }),
                claim_lost: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &RunKey {
        &self.inner.key
    }

    pub fn task_id(&self) -> &str {
        &self.inner.key.task_id
    }

    pub fn run_id(&self) -> u32 {
        self.inner.key.run_id
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.inner.definition
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.inner.worker
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Current claim expiry.
    pub fn taken_until(&self) -> DateTime<Utc> {
        self.state().taken_until
    }

    pub(crate) fn set_taken_until(&self, taken_until: DateTime<Utc>) {
        self.state().taken_until = taken_until;
    }

    /// `Claimed -> Running`. Returns false from any other status.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state();
        if state.status == TaskStatus::Claimed {
            state.status = TaskStatus::Running;
            true
        } else {
            false
        }
    }

    /// Moves to `Resolved`. Only the first caller gets `true`.
    pub(crate) fn begin_resolve(&self) -> bool {
        let mut state = self.state();
        if state.status == TaskStatus::Resolved {
            return false;
        }
        state.status = TaskStatus::Resolved;
        true
    }

    /// Token cancelled when the queue no longer honours this claim.
    pub fn claim_lost(&self) -> CancellationToken {
        self.inner.claim_lost.clone()
    }

    pub fn is_claim_lost(&self) -> bool {
        self.inner.claim_lost.is_cancelled()
    }

    pub(crate) fn signal_claim_lost(&self) {
        self.inner.claim_lost.cancel();
    }

    /// Identity handed to the engine when building the sandbox.
    pub fn sandbox_context(&self) -> SandboxContext {
        let worker = &self.inner.worker;
        SandboxContext {
            task_id: self.inner.key.task_id.clone(),
            run_id: self.inner.key.run_id,
            provisioner_id: worker.provisioner_id.clone(),
            worker_type: worker.worker_type.clone(),
            worker_group: worker.worker_group.clone(),
            worker_id: worker.worker_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            RunKey::new("abc", 1),
            WorkerIdentity {
                provisioner_id: "p".into(),
                worker_type: "wt".into(),
                worker_group: "g".into(),
                worker_id: "w".into(),
            },
            TaskDefinition::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_transitions() {
        let task = task();
        assert_eq!(task.status(), TaskStatus::Claimed);
        assert!(task.mark_running());
        assert!(!task.mark_running());
        assert!(task.begin_resolve());
        assert!(!task.begin_resolve());
        assert_eq!(task.status(), TaskStatus::Resolved);
    }

    #[test]
    fn test_clones_share_claim_lost_signal() {
        let task = task();
        let clone = task.clone();
        let token = task.claim_lost();
        clone.signal_claim_lost();
        assert!(task.is_claim_lost());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_sandbox_context() {
        let ctx = task().sandbox_context();
        assert_eq!(ctx.task_id, "abc");
        assert_eq!(ctx.run_id, 1);
        assert_eq!(ctx.worker_id, "w");
    }
}
