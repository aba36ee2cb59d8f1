//! Task manager: claims runs up to capacity and drives each through a
//! pipeline.
//!
//! # Features
//!
//! - Capacity bounded by config and engine concurrency
//! - Graceful drain on shutdown with a hard timeout
//! - Pause on repeated internal faults
//! - Optional stop after a number of tasks or an idle period

pub mod artifacts;
pub mod caches;
pub mod counter;
pub mod faults;
mod pipeline;
pub mod proxy;
mod runs;
pub mod tasklog;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, ProxyHandler};
use crate::metrics::MetricsCollector;
use crate::queue::{ExceptionReason, Outcome, QueueService, Task, TaskStatus};

pub use artifacts::{ArtifactStore, LocalArtifactStore};
pub use caches::{CacheLease, CachePool};
pub use counter::{CapacitySlot, TaskCounter};
pub use faults::FaultTracker;
pub use pipeline::RunReport;
pub use proxy::{TaskInfoProxy, TASK_INFO_PROXY};
pub use tasklog::{TaskLog, TASK_LOG_ARTIFACT};

use pipeline::PipelineContext;
use runs::RunTable;

/// Errors that can occur in the task manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager is already running.
    #[error("Task manager is already running")]
    AlreadyRunning,

    /// Capacity resolved to zero.
    #[error("Effective capacity is zero")]
    NoCapacity,
}

/// Configuration for the task manager.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Maximum concurrently running tasks.
    pub max_capacity: usize,
    /// Delay between claim attempts when nothing is pending.
    pub poll_interval: Duration,
    /// How long a drain may take before pipelines are aborted.
    pub shutdown_timeout: Duration,
    /// How long a stopped sandbox gets to finish executing.
    pub stop_grace: Duration,
    /// Internal faults that trigger a pause. Zero disables pausing.
    pub fault_threshold: u32,
    pub fault_window: Duration,
    pub fault_pause: Duration,
    /// Stop claiming after this many tasks.
    pub max_tasks: Option<u64>,
    /// Stop after being idle this long.
    pub idle_timeout: Option<Duration>,
    /// Environment variables set in every sandbox.
    pub env: BTreeMap<String, String>,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1,
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(600),
            stop_grace: Duration::from_secs(30),
            fault_threshold: 5,
            fault_window: Duration::from_secs(900),
            fault_pause: Duration::from_secs(300),
            max_tasks: None,
            idle_timeout: None,
            env: BTreeMap::new(),
        }
    }
}

impl TaskManagerConfig {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Pauses claiming for `pause` after `threshold` internal faults within
    /// `window`.
    pub fn with_fault_policy(mut self, threshold: u32, window: Duration, pause: Duration) -> Self {
        self.fault_threshold = threshold;
        self.fault_window = window;
        self.fault_pause = pause;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: u64) -> Self {
        self.max_tasks = Some(max_tasks);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Counters describing what the manager did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub exceptions: u64,
    pub claims_lost: u64,
    /// Runs whose outcome could not be reported.
    pub unresolved: u64,
    pub internal_faults: u64,
}

impl ManagerStats {
    /// Runs the queue accepted an outcome for.
    pub fn total_resolved(&self) -> u64 {
        self.completed + self.failed + self.exceptions
    }
}

#[derive(Default)]
struct SharedManagerStats {
    claimed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    exceptions: AtomicU64,
    claims_lost: AtomicU64,
    unresolved: AtomicU64,
}

impl SharedManagerStats {
    fn record_claim(&self) {
        self.claimed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_report(&self, report: &RunReport) {
        let counter = match report {
            RunReport::Resolved(Outcome::Completed) => &self.completed,
            RunReport::Resolved(Outcome::Failed) => &self.failed,
            RunReport::Resolved(Outcome::Exception(_)) => &self.exceptions,
            RunReport::ClaimLost => &self.claims_lost,
            RunReport::Unresolved { .. } => &self.unresolved,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn to_manager_stats(&self, internal_faults: u64) -> ManagerStats {
        ManagerStats {
            claimed: self.claimed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            exceptions: self.exceptions.load(Ordering::SeqCst),
            claims_lost: self.claims_lost.load(Ordering::SeqCst),
            unresolved: self.unresolved.load(Ordering::SeqCst),
            internal_faults,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Shutdown,
    MaxTasks,
    Idle,
}

type Pipelines = JoinSet<(Task, RunReport)>;

/// Claims and runs tasks until shut down.
pub struct TaskManager {
    config: TaskManagerConfig,
    engine: Arc<dyn Engine>,
    queue: Arc<QueueService>,
    caches: Arc<CachePool>,
    artifacts: Arc<dyn ArtifactStore>,
    proxies: Vec<(String, Arc<dyn ProxyHandler>)>,
    counter: Arc<TaskCounter>,
    faults: Arc<FaultTracker>,
    runs: Arc<RunTable>,
    shutdown: CancellationToken,
    stats: Arc<SharedManagerStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        engine: Arc<dyn Engine>,
        queue: Arc<QueueService>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let faults = FaultTracker::new(config.fault_threshold, config.fault_window, config.fault_pause);
        Self {
            caches: Arc::new(CachePool::new(Arc::clone(&engine))),
            config,
            engine,
            queue,
            artifacts,
            proxies: Vec::new(),
            counter: Arc::new(TaskCounter::new()),
            faults: Arc::new(faults),
            runs: Arc::new(RunTable::new()),
            shutdown: CancellationToken::new(),
            stats: Arc::new(SharedManagerStats::default()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Adds a proxy attached to every sandbox under `name`.
    pub fn with_proxy(mut self, name: impl Into<String>, handler: Arc<dyn ProxyHandler>) -> Self {
        self.proxies.push((name.into(), handler));
        self
    }

    /// Token that starts a graceful drain when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts a graceful drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Configured capacity bounded by the engine's concurrency limit.
    pub fn capacity(&self) -> usize {
        match self.engine.capabilities().max_concurrency {
            Some(limit) => self.config.max_capacity.min(limit),
            None => self.config.max_capacity,
        }
    }

    /// Number of pipelines currently holding capacity.
    pub fn running(&self) -> usize {
        self.counter.value()
    }

    /// Sandboxes created by pipelines and not yet closed.
    pub fn open_sandboxes(&self) -> usize {
        self.runs.open_sandboxes()
    }

    pub fn caches(&self) -> &Arc<CachePool> {
        &self.caches
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.to_manager_stats(self.faults.total())
    }

    /// Runs the claim loop until shutdown or a lifecycle limit, then drains.
    ///
    /// # Errors
    ///
    /// - `ManagerError::AlreadyRunning` if called concurrently
    /// - `ManagerError::NoCapacity` if the effective capacity is zero
    pub async fn run(&self) -> Result<ManagerStats, ManagerError> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Err(ManagerError::NoCapacity);
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyRunning);
        }

        self.metrics.set_capacity(capacity);
        info!(
            engine = self.engine.name(),
            capacity = capacity,
            "Task manager started"
        );

        let ctx = Arc::new(PipelineContext {
            engine: Arc::clone(&self.engine),
            capabilities: self.engine.capabilities(),
            queue: Arc::clone(&self.queue),
            caches: Arc::clone(&self.caches),
            artifacts: Arc::clone(&self.artifacts),
            proxies: self.proxies.clone(),
            faults: Arc::clone(&self.faults),
            runs: Arc::clone(&self.runs),
            env: self.config.env.clone(),
            shutdown: self.shutdown.clone(),
            stop_grace: self.config.stop_grace,
            metrics: self.metrics,
        });

        let mut pipelines = Pipelines::new();

        let reason = self.claim_loop(&ctx, capacity, &mut pipelines).await;
        match reason {
            StopReason::Shutdown => info!(running = pipelines.len(), "Draining task manager"),
            StopReason::MaxTasks | StopReason::Idle => {
                info!(
                    reason = ?reason,
                    running = pipelines.len(),
                    "Lifecycle limit reached, waiting for running tasks"
                );
                loop {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        joined = pipelines.join_next() => match joined {
                            Some(joined) => self.reap(joined),
                            None => break,
                        },
                    }
                }
            }
        }

        self.drain(&mut pipelines).await;

        if let Err(e) = self.caches.dispose_all().await {
            warn!(error = %e, "Failed to dispose cache folders");
        }
        if let Err(e) = self.engine.dispose().await {
            warn!(engine = self.engine.name(), error = %e, "Failed to dispose engine");
        }
        self.metrics.set_capacity(0);
        self.is_running.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            claimed = stats.claimed,
            resolved = stats.total_resolved(),
            claims_lost = stats.claims_lost,
            unresolved = stats.unresolved,
            "Task manager stopped"
        );
        Ok(stats)
    }

    async fn claim_loop(
        &self,
        ctx: &Arc<PipelineContext>,
        capacity: usize,
        pipelines: &mut Pipelines,
    ) -> StopReason {
        let mut claimed: u64 = 0;
        loop {
            while let Some(joined) = pipelines.try_join_next() {
                self.reap(joined);
            }

            if self.shutdown.is_cancelled() {
                return StopReason::Shutdown;
            }
            if self.config.max_tasks.is_some_and(|max| claimed >= max) {
                return StopReason::MaxTasks;
            }
            if let Some(limit) = self.config.idle_timeout {
                if self.counter.idle_time().is_some_and(|idle| idle >= limit) {
                    return StopReason::Idle;
                }
            }

            if let Some(pause) = self.faults.pause_remaining() {
                warn!(pause_secs = pause.as_secs(), "Claiming paused after internal faults");
                self.wait(pause, pipelines).await;
                continue;
            }

            if self.counter.value() >= capacity {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = self.counter.wait_for_less_than(capacity) => {}
                    Some(joined) = pipelines.join_next() => self.reap(joined),
                }
                continue;
            }

            match self.queue.claim_next().await {
                Ok(Some(task)) => {
                    claimed += 1;
                    self.stats.record_claim();
                    debug!(task_id = %task.task_id(), run_id = task.run_id(), "Starting pipeline");
                    let slot = self.counter.acquire();
                    let log = self.runs.insert(&task);
                    pipelines.spawn(pipeline::run(Arc::clone(ctx), task, log, slot));
                }
                Ok(None) => {
                    self.wait(self.config.poll_interval, pipelines).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim task");
                    self.wait(self.config.poll_interval, pipelines).await;
                }
            }
        }
    }

    /// Sleeps for `duration`, waking early on shutdown or a finished pipeline.
    async fn wait(&self, duration: Duration, pipelines: &mut Pipelines) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
            Some(joined) = pipelines.join_next() => self.reap(joined),
        }
    }

    fn reap(&self, joined: Result<(Task, RunReport), JoinError>) {
        match joined {
            Ok((task, report)) => {
                self.runs.remove(task.key());
                debug!(task_id = %task.task_id(), run_id = task.run_id(), report = ?report, "Pipeline finished");
                self.stats.record_report(&report);
            }
            Err(e) if e.is_cancelled() => debug!("Pipeline aborted"),
            Err(e) => error!(error = %e, "Pipeline task failed"),
        }
    }

    /// Signals every pipeline to stop and waits up to the shutdown timeout.
    ///
    /// Pipelines still running afterwards are aborted. Their sandboxes are
    /// closed here and their runs reported as `worker-shutdown`, before the
    /// caller disposes caches and the engine.
    async fn drain(&self, pipelines: &mut Pipelines) {
        self.shutdown.cancel();

        let timeout = self.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = pipelines.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = pipelines.len(),
                timeout_secs = timeout.as_secs(),
                "Shutdown timeout reached, aborting pipelines"
            );
            pipelines.abort_all();
            while let Some(joined) = pipelines.join_next().await {
                self.reap(joined);
            }
        }

        for mut run in self.runs.drain() {
            run.close_sandbox().await;
            let task = &run.task;
            if task.status() == TaskStatus::Resolved {
                continue;
            }
            if task.is_claim_lost() {
                self.queue.acknowledge_claim_lost(task);
                self.stats.record_report(&RunReport::ClaimLost);
                continue;
            }
            let outcome = Outcome::Exception(ExceptionReason::WorkerShutdown);
            run.log
                .write("Worker shutdown timeout reached, the task was aborted");
            run.log.write(format!("Resolving run as {outcome}"));
            run.log.upload(self.artifacts.as_ref(), task.key()).await;
            let report = match self.queue.resolve(task, outcome).await {
                Ok(()) => RunReport::Resolved(outcome),
                Err(e) if e.is_claim_lost() => {
                    self.queue.acknowledge_claim_lost(task);
                    RunReport::ClaimLost
                }
                Err(e) => {
                    error!(run = %task.key(), error = %e, "Failed to resolve aborted run");
                    RunReport::Unresolved {
                        outcome,
                        error: e.to_string(),
                    }
                }
            };
            self.stats.record_report(&report);
        }
    }
}
