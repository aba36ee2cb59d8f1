//! Queue service: claims, reclaim timers and resolution.
//!
//! Every claimed run gets a [`ClaimRecord`] and a timer task. The timer
//! reclaims at `expiry - expiration_offset`, measured on the monotonic clock
//! from the moment the expiry was received. When the queue reports the claim
//! gone, or reclaiming keeps failing until the claim has expired, the task's
//! claim-lost token is cancelled and the record dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::client::{Outcome, QueueError, RemoteQueue, RunKey, WorkerIdentity};
use super::task::Task;
use crate::metrics::MetricsCollector;

/// Configuration for the queue service.
#[derive(Debug, Clone)]
pub struct QueueServiceConfig {
    pub worker: WorkerIdentity,
    /// How long before expiry a claim is renewed.
    pub expiration_offset: Duration,
    pub retry: RetryPolicy,
}

impl QueueServiceConfig {
    pub fn new(worker: WorkerIdentity) -> Self {
        Self {
            worker,
            expiration_offset: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_expiration_offset(mut self, offset: Duration) -> Self {
        self.expiration_offset = offset;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Tracking entry for one claimed run.
#[derive(Debug)]
struct ClaimRecord {
    taken_until: DateTime<Utc>,
    reclaim_at: Instant,
    deadline: Instant,
    reclaims: u32,
    stop: CancellationToken,
}

/// Read-only view of a [`ClaimRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSnapshot {
    pub taken_until: DateTime<Utc>,
    pub reclaim_at: Instant,
    pub deadline: Instant,
    pub reclaims: u32,
}

/// Delay from now until a claim with `remaining` lifetime must be renewed.
///
/// Never later than `remaining - offset`; zero when the offset already covers
/// the whole lifetime.
pub fn reclaim_delay(remaining: Duration, offset: Duration) -> Duration {
    remaining.saturating_sub(offset)
}

fn remaining_until(taken_until: DateTime<Utc>) -> Duration {
    (taken_until - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Claims runs for one worker identity and keeps them claimed until resolved.
pub struct QueueService {
    remote: Arc<dyn RemoteQueue>,
    config: QueueServiceConfig,
    claims: Mutex<HashMap<RunKey, ClaimRecord>>,
    metrics: MetricsCollector,
}

impl QueueService {
    pub fn new(remote: Arc<dyn RemoteQueue>, config: QueueServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            remote,
            config,
            claims: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &QueueServiceConfig {
        &self.config
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<RunKey, ClaimRecord>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the next pending run, if there is one.
    ///
    /// Returns `Ok(None)` when nothing is pending or another worker won the
    /// race for the run. The caller should back off before polling again.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` when the queue stays unreachable after retries or
    /// rejects the request.
    pub async fn claim_next(self: &Arc<Self>) -> Result<Option<Task>, QueueError> {
        let worker = &self.config.worker;
        let pending = self
            .config
            .retry
            .retry("next-pending", || {
                self.remote
                    .next_pending(&worker.provisioner_id, &worker.worker_type)
            })
            .await
            .inspect_err(|_| self.metrics.record_claim("error"))?;

        let Some(pending) = pending else {
            self.metrics.record_claim("none");
            return Ok(None);
        };

        let key = RunKey::new(pending.task_id, pending.run_id);
        let response = match self
            .config
            .retry
            .retry("claim", || self.remote.claim(&key, worker))
            .await
        {
            Ok(response) => response,
            Err(QueueError::ClaimLost(reason)) => {
                debug!(task_id = %key.task_id, run_id = key.run_id, reason = %reason, "Run was claimed elsewhere");
                self.metrics.record_claim("conflict");
                return Ok(None);
            }
            Err(e) => {
                self.metrics.record_claim("error");
                return Err(e);
            }
        };

        let task = Task::new(key, worker.clone(), response.task, response.taken_until);
        self.track(&task);
        self.metrics.record_claim("claimed");
        info!(
            task_id = %task.task_id(),
            run_id = task.run_id(),
            taken_until = %response.taken_until,
            "Task claimed"
        );
        Ok(Some(task))
    }

    fn track(self: &Arc<Self>, task: &Task) {
        let now = Instant::now();
        let remaining = remaining_until(task.taken_until());
        let stop = CancellationToken::new();
        let record = ClaimRecord {
            taken_until: task.taken_until(),
            reclaim_at: now + reclaim_delay(remaining, self.config.expiration_offset),
            deadline: now + remaining,
            reclaims: 0,
            stop: stop.clone(),
        };
        self.claims().insert(task.key().clone(), record);

        let service = Arc::clone(self);
        let task = task.clone();
        tokio::spawn(async move { service.reclaim_loop(task, stop).await });
    }

    async fn reclaim_loop(self: Arc<Self>, task: Task, stop: CancellationToken) {
        loop {
            let reclaim_at = match self.claims().get(task.key()) {
                Some(record) => record.reclaim_at,
                None => return,
            };
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep_until(reclaim_at) => {}
            }
            if stop.is_cancelled() {
                return;
            }
            if let Err(e) = self.reclaim(&task).await {
                if task.is_claim_lost() || e.is_claim_lost() {
                    return;
                }
            }
        }
    }

    /// Extends the claim on `task`.
    ///
    /// Normally driven by the internal timer. Transient failures are retried
    /// without sleeping past the claim's expiry; if the claim expires
    /// meanwhile, or the queue reports it gone, the claim is treated as lost.
    ///
    /// # Errors
    ///
    /// - `QueueError::UnknownClaim` if the run is not tracked
    /// - `QueueError::ClaimLost` if the claim is gone
    /// - the last transient error if retries ran out before expiry
    pub async fn reclaim(&self, task: &Task) -> Result<(), QueueError> {
        let deadline = self
            .claims()
            .get(task.key())
            .map(|record| record.deadline)
            .ok_or_else(|| QueueError::UnknownClaim(task.key().clone()))?;

        let result = self
            .config
            .retry
            .retry_before("reclaim", Some(deadline), || self.remote.reclaim(task.key()))
            .await;

        match result {
            Ok(response) => {
                let now = Instant::now();
                let remaining = remaining_until(response.taken_until);
                if let Some(record) = self.claims().get_mut(task.key()) {
                    record.taken_until = response.taken_until;
                    record.deadline = now + remaining;
                    record.reclaim_at =
                        now + reclaim_delay(remaining, self.config.expiration_offset);
                    record.reclaims += 1;
                }
                task.set_taken_until(response.taken_until);
                self.metrics.record_reclaim("ok");
                debug!(
                    task_id = %task.task_id(),
                    run_id = task.run_id(),
                    taken_until = %response.taken_until,
                    "Claim renewed"
                );
                Ok(())
            }
            Err(QueueError::ClaimLost(reason)) => {
                self.metrics.record_reclaim("lost");
                self.lose_claim(task, &reason);
                Err(QueueError::ClaimLost(reason))
            }
            Err(e) => {
                self.metrics.record_reclaim("error");
                let now = Instant::now();
                if now >= deadline {
                    self.lose_claim(task, "claim expired before it could be renewed");
                    return Err(QueueError::ClaimLost(e.to_string()));
                }
                warn!(
                    task_id = %task.task_id(),
                    run_id = task.run_id(),
                    error = %e,
                    "Reclaim failed, will retry before expiry"
                );
                let retry_at = (now + self.config.retry.initial_delay).min(deadline);
                if let Some(record) = self.claims().get_mut(task.key()) {
                    record.reclaim_at = retry_at;
                }
                Err(e)
            }
        }
    }

    /// Marks the claim on `task` lost. A run that was resolved or acknowledged
    /// meanwhile has no record left and is not signalled.
    fn lose_claim(&self, task: &Task, reason: &str) {
        let Some(record) = self.claims().remove(task.key()) else {
            debug!(
                task_id = %task.task_id(),
                run_id = task.run_id(),
                reason = reason,
                "Claim already released"
            );
            return;
        };
        record.stop.cancel();
        task.signal_claim_lost();
        self.metrics.record_claim_lost();
        warn!(
            task_id = %task.task_id(),
            run_id = task.run_id(),
            reason = reason,
            "Claim lost"
        );
    }

    fn forget(&self, key: &RunKey) {
        if let Some(record) = self.claims().remove(key) {
            record.stop.cancel();
        }
    }

    /// Reports the outcome of `task`. At most one call per run reaches the queue.
    ///
    /// # Errors
    ///
    /// - `QueueError::ClaimLost` if the claim was lost; the run must then be
    ///   acknowledged with [`acknowledge_claim_lost`](Self::acknowledge_claim_lost)
    /// - `QueueError::AlreadyResolved` on a second call
    /// - the queue error if reporting failed after retries
    pub async fn resolve(&self, task: &Task, outcome: Outcome) -> Result<(), QueueError> {
        if task.is_claim_lost() {
            return Err(QueueError::ClaimLost(format!(
                "claim on {} was lost",
                task.key()
            )));
        }
        if !task.begin_resolve() {
            return Err(QueueError::AlreadyResolved(task.key().clone()));
        }
        self.forget(task.key());

        let result = self
            .config
            .retry
            .retry("resolve", || self.remote.resolve(task.key(), outcome))
            .await;

        match result {
            Ok(()) => {
                info!(
                    task_id = %task.task_id(),
                    run_id = task.run_id(),
                    outcome = %outcome,
                    "Task resolved"
                );
                Ok(())
            }
            Err(QueueError::ClaimLost(reason)) => {
                task.signal_claim_lost();
                self.metrics.record_claim_lost();
                warn!(
                    task_id = %task.task_id(),
                    run_id = task.run_id(),
                    reason = %reason,
                    "Claim lost before resolution"
                );
                Err(QueueError::ClaimLost(reason))
            }
            Err(e) => {
                error!(
                    task_id = %task.task_id(),
                    run_id = task.run_id(),
                    outcome = %outcome,
                    error = %e,
                    "Failed to resolve task"
                );
                Err(e)
            }
        }
    }

    /// Drops tracking for a run whose claim was lost. No resolve is sent.
    pub fn acknowledge_claim_lost(&self, task: &Task) {
        self.forget(task.key());
        task.begin_resolve();
        debug!(task_id = %task.task_id(), run_id = task.run_id(), "Claim loss acknowledged");
    }

    /// Number of runs with an active claim record.
    pub fn active_claims(&self) -> usize {
        self.claims().len()
    }

    pub fn claim_snapshot(&self, key: &RunKey) -> Option<ClaimSnapshot> {
        self.claims().get(key).map(|record| ClaimSnapshot {
            taken_until: record.taken_until,
            reclaim_at: record.reclaim_at,
            deadline: record.deadline,
            reclaims: record.reclaims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::{MemoryQueue, QueueOperation};
    use crate::queue::{ExceptionReason, TaskDefinition, TaskStatus};

    fn worker() -> WorkerIdentity {
        WorkerIdentity {
            provisioner_id: "prov".into(),
            worker_type: "wt".into(),
            worker_group: "group".into(),
            worker_id: "w-1".into(),
        }
    }

    fn service(queue: &Arc<MemoryQueue>, offset: Duration) -> Arc<QueueService> {
        QueueService::new(
            Arc::clone(queue) as Arc<dyn RemoteQueue>,
            QueueServiceConfig::new(worker())
                .with_expiration_offset(offset)
                .with_retry(RetryPolicy::new(3).with_initial_delay(Duration::from_secs(1))),
        )
    }

    #[test]
    fn test_reclaim_delay_never_after_expiry_minus_offset() {
        for d in [1u64, 2, 30, 300, 1200, 86_400] {
            for o in [0u64, 1, 29, 299, 1199] {
                if o >= d {
                    continue;
                }
                let delay = reclaim_delay(Duration::from_secs(d), Duration::from_secs(o));
                assert!(delay <= Duration::from_secs(d - o), "D={d} O={o}");
                assert_eq!(delay, Duration::from_secs(d - o));
            }
        }
        assert_eq!(
            reclaim_delay(Duration::from_secs(10), Duration::from_secs(20)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_claim_next_none_when_queue_empty() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        let service = service(&queue, Duration::from_secs(300));
        assert!(service.claim_next().await.unwrap().is_none());
        assert_eq!(service.active_claims(), 0);
    }

    #[tokio::test]
    async fn test_claim_schedules_reclaim_before_expiry() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(300));

        let before = Instant::now();
        let task = service.claim_next().await.unwrap().unwrap();
        let snapshot = service.claim_snapshot(task.key()).unwrap();

        assert_eq!(task.status(), TaskStatus::Claimed);
        assert!(snapshot.reclaim_at <= snapshot.deadline - Duration::from_secs(300));
        assert!(snapshot.reclaim_at >= before + Duration::from_secs(890));
        assert_eq!(service.active_claims(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_reclaims_until_resolved() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(20));

        let task = service.claim_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        let reclaims = queue.reclaims_for(task.key());
        assert!(reclaims >= 2, "expected periodic reclaims, got {reclaims}");
        assert!(!task.is_claim_lost());

        service.resolve(&task, Outcome::Completed).await.unwrap();
        assert_eq!(service.active_claims(), 0);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(queue.reclaims_for(task.key()), reclaims);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_claim_signals_claim_lost() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(20));

        let task = service.claim_next().await.unwrap().unwrap();
        queue.revoke_claim(task.key());
        let lost = task.claim_lost();

        tokio::time::timeout(Duration::from_secs(120), lost.cancelled())
            .await
            .unwrap();
        assert_eq!(service.active_claims(), 0);
        assert!(service.resolve(&task, Outcome::Completed).await.unwrap_err().is_claim_lost());
        assert!(queue.resolutions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_reclaim_failures_are_retried() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(20));

        let task = service.claim_next().await.unwrap().unwrap();
        queue.fail_next(QueueOperation::Reclaim, 2);
        tokio::time::sleep(Duration::from_secs(50)).await;

        assert!(!task.is_claim_lost());
        assert_eq!(queue.reclaims_for(task.key()), 1);
        service.resolve(&task, Outcome::Completed).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_failing_past_expiry_loses_claim() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(20));

        let task = service.claim_next().await.unwrap().unwrap();
        queue.fail_next(QueueOperation::Reclaim, usize::MAX);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(task.is_claim_lost());
        assert_eq!(service.active_claims(), 0);
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(300));

        let task = service.claim_next().await.unwrap().unwrap();
        service
            .resolve(&task, Outcome::Exception(ExceptionReason::MalformedPayload))
            .await
            .unwrap();
        let second = service.resolve(&task, Outcome::Completed).await;
        assert!(matches!(second, Err(QueueError::AlreadyResolved(_))));
        assert_eq!(
            queue.resolutions(),
            vec![(
                task.key().clone(),
                Outcome::Exception(ExceptionReason::MalformedPayload)
            )]
        );
    }

    #[tokio::test]
    async fn test_claim_conflict_counts_as_none() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        queue.push_task(TaskDefinition::default());
        queue.fail_next(QueueOperation::ClaimConflict, 1);
        let service = service(&queue, Duration::from_secs(300));

        assert!(service.claim_next().await.unwrap().is_none());
        assert!(service.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_claim_loss_after_resolve_is_ignored() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(300));

        let task = service.claim_next().await.unwrap().unwrap();
        service.resolve(&task, Outcome::Completed).await.unwrap();

        // A reclaim that was in flight while resolving comes back with 409.
        service.lose_claim(&task, "run already resolved");
        assert!(!task.is_claim_lost());
        assert_eq!(task.status(), TaskStatus::Resolved);
        assert_eq!(service.active_claims(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_claim_lost_removes_record() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(1200)));
        queue.push_task(TaskDefinition::default());
        let service = service(&queue, Duration::from_secs(300));

        let task = service.claim_next().await.unwrap().unwrap();
        service.acknowledge_claim_lost(&task);
        assert_eq!(service.active_claims(), 0);
        assert_eq!(task.status(), TaskStatus::Resolved);
    }
}
