//! Per-run pipeline: sandbox, attachments, execution, artifacts, resolution.
//!
//! Steps run in a fixed order:
//!
//! 1. create the sandbox from the payload
//! 2. set environment variables, attach cache folders and proxies
//! 3. execute, racing claim loss, shutdown and `maxRunTime`
//! 4. extract artifacts
//! 5. release cache leases
//! 6. store the task log and resolve the run
//! 7. close the sandbox
//!
//! The sandbox is registered in the manager's run table, which closes it if
//! the pipeline is aborted before reaching the last step.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifacts::ArtifactStore;
use super::caches::{CacheLease, CachePool};
use super::counter::CapacitySlot;
use super::faults::FaultTracker;
use super::proxy::{TaskInfoProxy, TASK_INFO_PROXY};
use super::runs::RunTable;
use super::tasklog::TaskLog;
use crate::engine::{
    ArtifactReader, Capabilities, Capability, Engine, ProxyHandler, Sandbox,
};
use crate::error::{ArtifactError, EngineError};
use crate::metrics::MetricsCollector;
use crate::queue::{
    ArtifactKind, ArtifactSpec, ExceptionReason, Outcome, QueueError, QueueService, Task,
};

/// What happened to a run once its pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// The queue accepted the outcome.
    Resolved(Outcome),
    /// The claim was lost; nothing was reported.
    ClaimLost,
    /// Reporting the outcome failed.
    Unresolved { outcome: Outcome, error: String },
}

/// State shared by every pipeline of one manager.
pub(crate) struct PipelineContext {
    pub engine: Arc<dyn Engine>,
    pub capabilities: Capabilities,
    pub queue: Arc<QueueService>,
    pub caches: Arc<CachePool>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub proxies: Vec<(String, Arc<dyn ProxyHandler>)>,
    pub faults: Arc<FaultTracker>,
    pub runs: Arc<RunTable>,
    /// Variables set in every sandbox before the task's own.
    pub env: BTreeMap<String, String>,
    pub shutdown: CancellationToken,
    pub stop_grace: Duration,
    pub metrics: MetricsCollector,
}

enum Decision {
    Resolve(Outcome),
    ClaimLost,
}

impl Decision {
    fn exception(reason: ExceptionReason) -> Self {
        Decision::Resolve(Outcome::Exception(reason))
    }
}

enum Interruption {
    ClaimLost,
    Shutdown,
    MaxRunTime,
}

impl Interruption {
    fn as_str(&self) -> &'static str {
        match self {
            Interruption::ClaimLost => "claim-lost",
            Interruption::Shutdown => "worker-shutdown",
            Interruption::MaxRunTime => "max-run-time",
        }
    }
}

enum Execution {
    Finished(Result<bool, EngineError>),
    Interrupted(Interruption),
}

enum ExtractError {
    Engine(EngineError),
    Store(ArtifactError),
}

impl From<EngineError> for ExtractError {
    fn from(e: EngineError) -> Self {
        ExtractError::Engine(e)
    }
}

impl From<ArtifactError> for ExtractError {
    fn from(e: ArtifactError) -> Self {
        ExtractError::Store(e)
    }
}

/// Runs one claimed task to resolution and releases its capacity slot.
///
/// A panic inside the pipeline is reported as `internal-error`.
pub(crate) async fn run(
    ctx: Arc<PipelineContext>,
    task: Task,
    log: Arc<TaskLog>,
    slot: CapacitySlot,
) -> (Task, RunReport) {
    let started = Instant::now();
    let pipeline = Pipeline {
        ctx: Arc::clone(&ctx),
        task: task.clone(),
        log: Arc::clone(&log),
        leases: Vec::new(),
    };

    let report = match AssertUnwindSafe(pipeline.run()).catch_unwind().await {
        Ok(report) => report,
        Err(_) => {
            error!(task_id = %task.task_id(), run_id = task.run_id(), "Task pipeline panicked");
            ctx.faults.record_fault();
            ctx.metrics.record_internal_fault();
            ctx.runs.close_sandbox(task.key()).await;
            log.write("Internal worker error while running the task");
            let outcome = Outcome::Exception(ExceptionReason::InternalError);
            resolve(&ctx, &task, &log, outcome).await
        }
    };

    if let RunReport::Resolved(outcome) = &report {
        ctx.metrics.record_resolution(*outcome, started.elapsed());
    }
    drop(slot);
    (task, report)
}

/// Stores the task log, then reports `outcome`.
async fn resolve(ctx: &PipelineContext, task: &Task, log: &TaskLog, outcome: Outcome) -> RunReport {
    if !task.is_claim_lost() {
        log.write(format!("Resolving run as {outcome}"));
        log.upload(ctx.artifacts.as_ref(), task.key()).await;
    }
    match ctx.queue.resolve(task, outcome).await {
        Ok(()) => RunReport::Resolved(outcome),
        Err(QueueError::ClaimLost(_)) => {
            ctx.queue.acknowledge_claim_lost(task);
            RunReport::ClaimLost
        }
        Err(e) => RunReport::Unresolved {
            outcome,
            error: e.to_string(),
        },
    }
}

fn flatten(joined: Result<Result<bool, EngineError>, JoinError>) -> Result<bool, EngineError> {
    joined.unwrap_or_else(|e| Err(EngineError::internal(format!("execution task failed: {e}"))))
}

struct Pipeline {
    ctx: Arc<PipelineContext>,
    task: Task,
    log: Arc<TaskLog>,
    leases: Vec<CacheLease>,
}

impl Pipeline {
    async fn run(mut self) -> RunReport {
        let decision = self.drive().await;
        self.leases.clear();

        let report = match decision {
            Decision::ClaimLost => {
                self.ctx.queue.acknowledge_claim_lost(&self.task);
                RunReport::ClaimLost
            }
            Decision::Resolve(outcome) => {
                resolve(&self.ctx, &self.task, &self.log, outcome).await
            }
        };

        self.close_sandbox().await;
        report
    }

    async fn close_sandbox(&self) {
        self.ctx.runs.close_sandbox(self.task.key()).await;
    }

    fn interrupted_before_start(&self) -> Option<Decision> {
        if self.task.is_claim_lost() {
            return Some(Decision::ClaimLost);
        }
        if self.ctx.shutdown.is_cancelled() {
            self.log.write("Worker is shutting down, the task was not started");
            return Some(Decision::exception(ExceptionReason::WorkerShutdown));
        }
        None
    }

    async fn drive(&mut self) -> Decision {
        if let Some(decision) = self.interrupted_before_start() {
            return decision;
        }

        let worker = self.task.worker();
        self.log.write(format!(
            "Task {} run {} claimed by {}/{} on engine '{}'",
            self.task.task_id(),
            self.task.run_id(),
            worker.worker_group,
            worker.worker_id,
            self.ctx.engine.name()
        ));

        let context = self.task.sandbox_context();
        let sandbox = match self
            .ctx
            .engine
            .new_sandbox(&self.task.definition().payload, &context)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => return self.engine_failure(e, "create sandbox").await,
        };
        debug!(
            task_id = %self.task.task_id(),
            run_id = self.task.run_id(),
            sandbox_id = sandbox.id(),
            "Sandbox created"
        );
        self.ctx
            .runs
            .set_sandbox(self.task.key(), Arc::clone(&sandbox));

        if let Err(decision) = self.set_environment(&sandbox).await {
            return decision;
        }
        if let Err(decision) = self.attach_caches(&sandbox).await {
            return decision;
        }
        if let Err(decision) = self.attach_proxies(&sandbox).await {
            return decision;
        }
        if let Some(decision) = self.interrupted_before_start() {
            return decision;
        }

        self.task.mark_running();
        self.log.write("Execution started");
        match self.execute(&sandbox).await {
            Execution::Interrupted(Interruption::ClaimLost) => Decision::ClaimLost,
            Execution::Interrupted(Interruption::Shutdown) => {
                Decision::exception(ExceptionReason::WorkerShutdown)
            }
            Execution::Interrupted(Interruption::MaxRunTime) => Decision::Resolve(Outcome::Failed),
            Execution::Finished(Ok(success)) => {
                self.log.write(if success {
                    "Execution finished successfully"
                } else {
                    "Execution finished with a task failure"
                });
                let outcome = if success {
                    Outcome::Completed
                } else {
                    Outcome::Failed
                };
                match self.extract_artifacts(&sandbox, outcome).await {
                    Ok(outcome) => Decision::Resolve(outcome),
                    Err(decision) => decision,
                }
            }
            Execution::Finished(Err(e)) => self.engine_failure(e, "execute").await,
        }
    }

    /// Maps an engine error to a decision. Internal errors close the sandbox
    /// immediately and count towards the fault threshold.
    async fn engine_failure(&mut self, err: EngineError, stage: &str) -> Decision {
        if err.is_recoverable() {
            warn!(
                task_id = %self.task.task_id(),
                run_id = self.task.run_id(),
                stage,
                error = %err,
                "Task payload rejected"
            );
            self.log.write(format!("Task payload rejected while trying to {stage}: {err}"));
            return Decision::exception(ExceptionReason::MalformedPayload);
        }

        error!(
            task_id = %self.task.task_id(),
            run_id = self.task.run_id(),
            stage,
            error = %err,
            "Internal engine error"
        );
        self.log.write(format!("Internal worker error while trying to {stage}"));
        self.ctx.metrics.record_internal_fault();
        if self.ctx.faults.record_fault() {
            warn!("Internal fault threshold reached, pausing claims");
        }
        self.close_sandbox().await;
        Decision::exception(ExceptionReason::InternalError)
    }

    /// Sets `TASK_ID`, `RUN_ID`, the worker's variables and then the task's.
    ///
    /// On an engine without environment support only a task that asks for
    /// variables is rejected.
    async fn set_environment(&mut self, sandbox: &Arc<dyn Sandbox>) -> Result<(), Decision> {
        let requested = &self.task.definition().env;
        if !self.ctx.capabilities.supports(Capability::Environment) {
            if requested.is_empty() {
                debug!(engine = self.ctx.engine.name(), "Engine has no environment support");
                return Ok(());
            }
            let err = EngineError::FeatureNotSupported(Capability::Environment);
            return Err(self.engine_failure(err, "set environment variables").await);
        }

        let mut env = BTreeMap::new();
        env.insert("TASK_ID".to_string(), self.task.task_id().to_string());
        env.insert("RUN_ID".to_string(), self.task.run_id().to_string());
        env.extend(self.ctx.env.clone());
        env.extend(requested.clone());

        for (name, value) in &env {
            if let Err(e) = sandbox.set_environment_variable(name, value).await {
                return Err(self.engine_failure(e, "set environment variables").await);
            }
        }
        Ok(())
    }

    async fn attach_caches(&mut self, sandbox: &Arc<dyn Sandbox>) -> Result<(), Decision> {
        let caches = self.task.definition().caches.clone();
        for spec in caches {
            let capability = if spec.read_only {
                Capability::ReadOnlyCache
            } else {
                Capability::MutableCache
            };
            let supported = self.ctx.capabilities.supports(capability)
                && self.ctx.capabilities.supports(Capability::CacheFolder);
            if !supported {
                if spec.optional {
                    warn!(cache = %spec.name, %capability, "Engine cannot mount cache, skipping");
                    self.log.write(format!(
                        "Optional cache '{}' skipped: engine has no {capability} support",
                        spec.name
                    ));
                    continue;
                }
                return Err(self
                    .engine_failure(EngineError::FeatureNotSupported(capability), "attach cache")
                    .await);
            }

            let lease = match self.ctx.caches.acquire(&spec.name, !spec.read_only).await {
                Ok(lease) => lease,
                Err(e) => return Err(self.engine_failure(e, "acquire cache").await),
            };
            let attached = if spec.read_only {
                sandbox
                    .attach_read_only_cache(&spec.mount_point, lease.volume())
                    .await
            } else {
                sandbox
                    .attach_mutable_cache(&spec.mount_point, lease.volume())
                    .await
            };
            match attached {
                Ok(()) => self.leases.push(lease),
                Err(e) if e.is_feature_not_supported() && spec.optional => {
                    warn!(cache = %spec.name, "Sandbox refused optional cache, skipping");
                    self.log.write(format!("Optional cache '{}' skipped: {e}", spec.name));
                }
                Err(e) => return Err(self.engine_failure(e, "attach cache").await),
            }
        }
        Ok(())
    }

    async fn attach_proxies(&mut self, sandbox: &Arc<dyn Sandbox>) -> Result<(), Decision> {
        if !self.ctx.capabilities.supports(Capability::Proxy) {
            debug!(engine = self.ctx.engine.name(), "Engine has no proxy support");
            self.log.write("Proxies skipped: engine has no proxy support");
            return Ok(());
        }

        let mut proxies: Vec<(String, Arc<dyn ProxyHandler>)> = vec![(
            TASK_INFO_PROXY.to_string(),
            Arc::new(TaskInfoProxy::new(&self.task)),
        )];
        proxies.extend(self.ctx.proxies.iter().cloned());

        for (name, handler) in proxies {
            match sandbox.attach_proxy(&name, handler).await {
                Ok(()) => {}
                Err(e) if e.is_feature_not_supported() => {
                    warn!(proxy = %name, "Sandbox refused proxy, skipping");
                    self.log.write(format!("Proxy '{name}' skipped: {e}"));
                }
                Err(e) => return Err(self.engine_failure(e, "attach proxy").await),
            }
        }
        Ok(())
    }

    async fn execute(&self, sandbox: &Arc<dyn Sandbox>) -> Execution {
        let runner = Arc::clone(sandbox);
        let metrics = self.ctx.metrics;
        metrics.sandbox_started();
        let mut handle = tokio::spawn(async move { runner.execute().await });

        let max_run_time = self.task.definition().max_run_time.map(Duration::from_secs);
        let deadline = async move {
            match max_run_time {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let claim_lost = self.task.claim_lost();
        let interruption = tokio::select! {
            joined = &mut handle => {
                metrics.sandbox_finished();
                return Execution::Finished(flatten(joined));
            }
            _ = claim_lost.cancelled() => Interruption::ClaimLost,
            _ = self.ctx.shutdown.cancelled() => Interruption::Shutdown,
            _ = &mut deadline => Interruption::MaxRunTime,
        };

        info!(
            task_id = %self.task.task_id(),
            run_id = self.task.run_id(),
            reason = interruption.as_str(),
            "Stopping sandbox"
        );
        self.log.write(format!("Stopping sandbox: {}", interruption.as_str()));
        if let Err(e) = sandbox.stop().await {
            warn!(sandbox_id = sandbox.id(), error = %e, "Failed to stop sandbox");
        }
        if tokio::time::timeout(self.ctx.stop_grace, &mut handle).await.is_err() {
            warn!(
                sandbox_id = sandbox.id(),
                grace_secs = self.ctx.stop_grace.as_secs(),
                "Sandbox did not stop in time, closing it"
            );
            handle.abort();
            self.log.write("Sandbox did not stop in time and was closed");
            self.close_sandbox().await;
        }
        metrics.sandbox_finished();
        Execution::Interrupted(interruption)
    }

    /// Uploads the requested artifacts.
    ///
    /// A missing mandatory artifact turns `completed` into `failed`.
    async fn extract_artifacts(
        &mut self,
        sandbox: &Arc<dyn Sandbox>,
        mut outcome: Outcome,
    ) -> Result<Outcome, Decision> {
        let artifacts = self.task.definition().artifacts.clone();
        for spec in artifacts {
            match self.upload(sandbox, &spec).await {
                Ok(bytes) => debug!(artifact = %spec.name, bytes, "Artifact uploaded"),
                Err(ExtractError::Engine(EngineError::ResourceNotFound(path))) => {
                    if spec.optional {
                        debug!(artifact = %spec.name, %path, "Optional artifact missing");
                        self.log.write(format!("Optional artifact '{}' missing: {path}", spec.name));
                        continue;
                    }
                    warn!(
                        task_id = %self.task.task_id(),
                        artifact = %spec.name,
                        %path,
                        "Required artifact missing"
                    );
                    self.log.write(format!("Required artifact '{}' missing: {path}", spec.name));
                    if outcome == Outcome::Completed {
                        outcome = Outcome::Failed;
                    }
                }
                Err(ExtractError::Engine(e)) if e.is_feature_not_supported() && spec.optional => {
                    warn!(artifact = %spec.name, "Engine cannot extract optional artifact, skipping");
                    self.log.write(format!("Optional artifact '{}' skipped: {e}", spec.name));
                }
                Err(ExtractError::Engine(e)) => {
                    return Err(self.engine_failure(e, "extract artifact").await);
                }
                Err(ExtractError::Store(ArtifactError::InvalidName(name))) => {
                    warn!(artifact = %name, "Invalid artifact name");
                    self.log.write(format!("Invalid artifact name '{name}'"));
                    return Err(Decision::exception(ExceptionReason::MalformedPayload));
                }
                Err(ExtractError::Store(e)) => {
                    return Err(self
                        .engine_failure(EngineError::internal(e.to_string()), "store artifact")
                        .await);
                }
            }
        }
        Ok(outcome)
    }

    async fn upload(&self, sandbox: &Arc<dyn Sandbox>, spec: &ArtifactSpec) -> Result<u64, ExtractError> {
        let run = self.task.key();
        let store = &self.ctx.artifacts;
        match spec.kind {
            ArtifactKind::File => {
                self.ctx.capabilities.require(Capability::ExtractFile)?;
                let artifact = sandbox.extract_file(&spec.path).await?;
                Ok(store.put(run, &spec.name, artifact).await?)
            }
            ArtifactKind::Folder => {
                self.ctx.capabilities.require(Capability::ExtractFolder)?;
                let mut entries = sandbox.extract_folder(&spec.path).await?;
                let mut total = 0;
                while let Some(entry) = entries.next().await {
                    let entry: ArtifactReader = entry?;
                    let name = format!("{}/{}", spec.name.trim_end_matches('/'), entry.path);
                    total += store.put(run, &name, entry).await?;
                }
                Ok(total)
            }
            ArtifactKind::Archive => {
                self.ctx.capabilities.require(Capability::ArchiveSandbox)?;
                let archive = sandbox.archive_sandbox().await?;
                Ok(store.put_archive(run, &spec.name, archive).await?)
            }
        }
    }
}
