//! In-memory queue for local runs and tests.
//!
//! Supports injecting transient failures and revoking claims so the claim
//! state machine can be exercised without a server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use super::client::{
    ClaimResponse, Outcome, PendingTask, QueueError, ReclaimResponse, RemoteQueue, RunKey,
    TaskDefinition, WorkerIdentity,
};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    NextPending,
    Claim,
    /// The claim call answers 409 as if another worker won the race.
    ClaimConflict,
    Reclaim,
    Resolve,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_task: u64,
    pending: VecDeque<(RunKey, TaskDefinition)>,
    claimed: HashMap<RunKey, (TaskDefinition, WorkerIdentity)>,
    revoked: HashSet<RunKey>,
    failures: HashMap<QueueOperation, usize>,
    reclaims: HashMap<RunKey, u32>,
    resolutions: Vec<(RunKey, Outcome)>,
}

impl MemoryState {
    fn take_failure(&mut self, operation: QueueOperation) -> bool {
        match self.failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A queue that lives in process memory.
pub struct MemoryQueue {
    claim_duration: Duration,
    state: Mutex<MemoryState>,
    resolved: watch::Sender<usize>,
}

impl MemoryQueue {
    /// Creates an empty queue whose claims last `claim_duration`.
    pub fn new(claim_duration: Duration) -> Self {
        Self {
            claim_duration,
            state: Mutex::new(MemoryState::default()),
            resolved: watch::channel(0).0,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(&self) -> chrono::DateTime<Utc> {
        let duration = chrono::Duration::from_std(self.claim_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(1200));
        Utc::now() + duration
    }

    /// Adds a task with run 0 and returns its key.
    pub fn push_task(&self, definition: TaskDefinition) -> RunKey {
        let mut state = self.state();
        state.next_task += 1;
        let key = RunKey::new(format!("task-{}", state.next_task), 0);
        state.pending.push_back((key.clone(), definition));
        key
    }

    /// Makes the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: QueueOperation, times: usize) {
        self.state().failures.insert(operation, times);
    }

    /// Makes further reclaim and resolve calls for `key` answer claim-lost.
    pub fn revoke_claim(&self, key: &RunKey) {
        self.state().revoked.insert(key.clone());
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn claimed_count(&self) -> usize {
        self.state().claimed.len()
    }

    /// Successful reclaims of `key`.
    pub fn reclaims_for(&self, key: &RunKey) -> u32 {
        self.state().reclaims.get(key).copied().unwrap_or(0)
    }

    /// Resolutions in the order they arrived.
    pub fn resolutions(&self) -> Vec<(RunKey, Outcome)> {
        self.state().resolutions.clone()
    }

    pub fn resolution(&self, key: &RunKey) -> Option<Outcome> {
        self.state()
            .resolutions
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| *outcome)
    }

    /// Waits until at least `count` runs have been resolved.
    pub async fn wait_for_resolutions(&self, count: usize) {
        let mut rx = self.resolved.subscribe();
        // The sender lives in self, so the channel cannot close while waiting.
        let _ = rx.wait_for(|resolved| *resolved >= count).await;
    }
}

#[async_trait]
impl RemoteQueue for MemoryQueue {
    async fn next_pending(
        &self,
        _provisioner_id: &str,
        _worker_type: &str,
    ) -> Result<Option<PendingTask>, QueueError> {
        let mut state = self.state();
        if state.take_failure(QueueOperation::NextPending) {
            return Err(QueueError::Transient("injected failure".into()));
        }
        Ok(state.pending.front().map(|(key, _)| PendingTask {
            task_id: key.task_id.clone(),
            run_id: key.run_id,
        }))
    }

    async fn claim(
        &self,
        run: &RunKey,
        worker: &WorkerIdentity,
    ) -> Result<ClaimResponse, QueueError> {
        let taken_until = self.expiry();
        let mut state = self.state();
        if state.take_failure(QueueOperation::Claim) {
            return Err(QueueError::Transient("injected failure".into()));
        }
        if state.take_failure(QueueOperation::ClaimConflict) {
            return Err(QueueError::ClaimLost("run claimed by another worker".into()));
        }
        let position = state
            .pending
            .iter()
            .position(|(key, _)| key == run)
            .ok_or_else(|| QueueError::ClaimLost(format!("run {run} is not pending")))?;
        let (key, definition) = state
            .pending
            .remove(position)
            .ok_or_else(|| QueueError::ClaimLost(format!("run {run} is not pending")))?;
        state
            .claimed
            .insert(key, (definition.clone(), worker.clone()));
        Ok(ClaimResponse {
            taken_until,
            task: definition,
        })
    }

    async fn reclaim(&self, run: &RunKey) -> Result<ReclaimResponse, QueueError> {
        let taken_until = self.expiry();
        let mut state = self.state();
        if state.take_failure(QueueOperation::Reclaim) {
            return Err(QueueError::Transient("injected failure".into()));
        }
        if state.revoked.contains(run) || !state.claimed.contains_key(run) {
            return Err(QueueError::ClaimLost(format!("run {run} is not claimed")));
        }
        *state.reclaims.entry(run.clone()).or_default() += 1;
        Ok(ReclaimResponse { taken_until })
    }

    async fn resolve(&self, run: &RunKey, outcome: Outcome) -> Result<(), QueueError> {
        let resolved = {
            let mut state = self.state();
            if state.take_failure(QueueOperation::Resolve) {
                return Err(QueueError::Transient("injected failure".into()));
            }
            if state.revoked.contains(run) || state.claimed.remove(run).is_none() {
                return Err(QueueError::ClaimLost(format!("run {run} is not claimed")));
            }
            state.resolutions.push((run.clone(), outcome));
            state.resolutions.len()
        };
        self.resolved.send_replace(resolved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerIdentity {
        WorkerIdentity {
            provisioner_id: "p".into(),
            worker_type: "wt".into(),
            worker_group: "g".into(),
            worker_id: "w".into(),
        }
    }

    #[tokio::test]
    async fn test_claim_moves_task_out_of_pending() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let key = queue.push_task(TaskDefinition::default());

        let pending = queue.next_pending("p", "wt").await.unwrap().unwrap();
        assert_eq!(pending.task_id, key.task_id);

        queue.claim(&key, &worker()).await.unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.claimed_count(), 1);
        assert!(queue.claim(&key, &worker()).await.unwrap_err().is_claim_lost());
    }

    #[tokio::test]
    async fn test_resolve_unclaimed_is_claim_lost() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let key = queue.push_task(TaskDefinition::default());
        assert!(queue
            .resolve(&key, Outcome::Completed)
            .await
            .unwrap_err()
            .is_claim_lost());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.fail_next(QueueOperation::NextPending, 1);
        assert!(queue.next_pending("p", "wt").await.unwrap_err().is_transient());
        assert!(queue.next_pending("p", "wt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_resolutions() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let key = queue.push_task(TaskDefinition::default());
        queue.claim(&key, &worker()).await.unwrap();
        queue.resolve(&key, Outcome::Failed).await.unwrap();
        queue.wait_for_resolutions(1).await;
        assert_eq!(queue.resolution(&key), Some(Outcome::Failed));
    }
}
