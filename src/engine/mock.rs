//! In-process mock engine.
//!
//! Each sandbox gets a temporary directory as its filesystem. The payload's
//! `start` section selects a built-in function to run:
//!
//! | function                        | behavior                                     |
//! |---------------------------------|----------------------------------------------|
//! | `true` / `false`                | succeed / fail                               |
//! | `write-files`                   | write `argument` into files under `output/`  |
//! | `write-volume`                  | write into `<mount>/<file>` of a mutable cache |
//! | `read-volume`                   | succeed if `<mount>/<file>` exists           |
//! | `ping-proxy`                    | GET `<proxy>/<path>`, save body to `output/` |
//! | `print-env`                     | write `NAME=value` lines to `output/env.txt` |
//! | `malformed-payload-after-start` | fail with a malformed-payload error          |
//! | `internal-error`                | fail with an internal error                  |
//!
//! `delay` (milliseconds) is slept before the function runs and is cut short
//! by `stop`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::EngineProvider;
use super::sandbox::{
    ArtifactReader, ArtifactStream, Lifecycle, ProxyHandler, ProxyRequest, Sandbox, SandboxState,
    Shell,
};
use super::volume::{Volume, VolumeKind};
use super::{Capabilities, Engine, SandboxContext, SandboxPayload};
use crate::error::{ConfigError, EngineError};

/// Longest accepted `delay`.
pub const MAX_DELAY_MS: u64 = 300_000;

/// Engine configuration, read from `engines.mock`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MockEngineConfig {
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Registers the mock engine under the name `mock`.
pub struct MockEngineProvider;

impl EngineProvider for MockEngineProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn description(&self) -> &'static str {
        "In-process engine running built-in functions in a temporary directory"
    }

    fn create(&self, config: &Value) -> Result<Arc<dyn Engine>, ConfigError> {
        let config: MockEngineConfig = if config.is_null() {
            MockEngineConfig::default()
        } else {
            serde_json::from_value(config.clone())?
        };
        Ok(Arc::new(MockEngine::new(config)))
    }
}

/// Counts sandboxes that are currently inside `execute`.
#[derive(Debug, Default)]
struct ExecutionTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicU64,
}

impl ExecutionTracker {
    fn enter(self: &Arc<Self>) -> ExecutionGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
        ExecutionGuard {
            tracker: Arc::clone(self),
        }
    }
}

struct ExecutionGuard {
    tracker: Arc<ExecutionTracker>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.tracker.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine whose sandboxes run built-in functions.
#[derive(Debug, Default)]
pub struct MockEngine {
    config: MockEngineConfig,
    tracker: Arc<ExecutionTracker>,
    sandboxes_created: AtomicU64,
}

impl MockEngine {
    pub fn new(config: MockEngineConfig) -> Self {
        Self {
            config,
            tracker: Arc::new(ExecutionTracker::default()),
            sandboxes_created: AtomicU64::new(0),
        }
    }

    /// Sandboxes currently executing.
    pub fn executing(&self) -> usize {
        self.tracker.current.load(Ordering::SeqCst)
    }

    /// Highest number of sandboxes ever executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.tracker.peak.load(Ordering::SeqCst)
    }

    /// Number of `execute` calls that actually started running.
    pub fn executions_started(&self) -> u64 {
        self.tracker.started.load(Ordering::SeqCst)
    }

    pub fn sandboxes_created(&self) -> u64 {
        self.sandboxes_created.load(Ordering::SeqCst)
    }

    async fn new_mock_volume(&self, kind: VolumeKind) -> Result<Arc<dyn Volume>, EngineError> {
        let dir = tempfile::Builder::new().prefix("mock-volume-").tempdir()?;
        let volume = MockVolume {
            id: Uuid::new_v4().to_string(),
            kind,
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            disposed: AtomicBool::new(false),
        };
        debug!(volume_id = %volume.id, kind = %kind, "Mock volume created");
        Ok(Arc::new(volume))
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::all();
        match self.config.max_concurrency {
            Some(max) => caps.with_max_concurrency(max),
            None => caps,
        }
    }

    async fn new_sandbox(
        &self,
        payload: &SandboxPayload,
        context: &SandboxContext,
    ) -> Result<Arc<dyn Sandbox>, EngineError> {
        let program = MockProgram::parse(payload)?;
        let root = tempfile::Builder::new().prefix("mock-sandbox-").tempdir()?;
        let id = Uuid::new_v4().to_string();

        self.sandboxes_created.fetch_add(1, Ordering::SeqCst);
        debug!(
            sandbox_id = %id,
            task_id = %context.task_id,
            run_id = context.run_id,
            function = program.function.as_str(),
            "Mock sandbox created"
        );

        Ok(Arc::new(MockSandbox {
            id,
            context: context.clone(),
            program,
            lifecycle: Lifecycle::new(),
            root_path: root.path().to_path_buf(),
            root: Mutex::new(Some(root)),
            mounts: Mutex::new(Vec::new()),
            proxies: Mutex::new(HashMap::new()),
            env: Mutex::new(BTreeMap::new()),
            stop: CancellationToken::new(),
            tracker: Arc::clone(&self.tracker),
        }))
    }

    async fn new_cache_folder(&self) -> Result<Arc<dyn Volume>, EngineError> {
        self.new_mock_volume(VolumeKind::CacheFolder).await
    }

    async fn new_volume(&self) -> Result<Arc<dyn Volume>, EngineError> {
        self.new_mock_volume(VolumeKind::Volume).await
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        info!(
            sandboxes = self.sandboxes_created(),
            peak_concurrency = self.peak_concurrency(),
            "Mock engine disposed"
        );
        Ok(())
    }
}

/// A temporary directory used as cache folder or volume.
#[derive(Debug)]
pub struct MockVolume {
    id: String,
    kind: VolumeKind,
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
    disposed: AtomicBool,
}

impl MockVolume {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Volume for MockVolume {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> VolumeKind {
        self.kind
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let dir = self
            .dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            dir.close()?;
        }
        debug!(volume_id = %self.id, "Mock volume disposed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockFunction {
    True,
    False,
    WriteFiles,
    WriteVolume,
    ReadVolume,
    PingProxy,
    PrintEnv,
    MalformedPayloadAfterStart,
    InternalError,
}

impl MockFunction {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "true" => MockFunction::True,
            "false" => MockFunction::False,
            "write-files" => MockFunction::WriteFiles,
            "write-volume" => MockFunction::WriteVolume,
            "read-volume" => MockFunction::ReadVolume,
            "ping-proxy" => MockFunction::PingProxy,
            "print-env" => MockFunction::PrintEnv,
            "malformed-payload-after-start" => MockFunction::MalformedPayloadAfterStart,
            "internal-error" => MockFunction::InternalError,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            MockFunction::True => "true",
            MockFunction::False => "false",
            MockFunction::WriteFiles => "write-files",
            MockFunction::WriteVolume => "write-volume",
            MockFunction::ReadVolume => "read-volume",
            MockFunction::PingProxy => "ping-proxy",
            MockFunction::PrintEnv => "print-env",
            MockFunction::MalformedPayloadAfterStart => "malformed-payload-after-start",
            MockFunction::InternalError => "internal-error",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MockStart {
    #[serde(default)]
    function: String,
    #[serde(default)]
    delay: u64,
    #[serde(default)]
    argument: String,
}

#[derive(Debug, Clone)]
struct MockProgram {
    function: MockFunction,
    delay: Duration,
    argument: String,
}

impl MockProgram {
    fn parse(payload: &SandboxPayload) -> Result<Self, EngineError> {
        if !payload.start.is_object() {
            return Err(EngineError::malformed("'start' must be an object"));
        }
        if !(payload.options.is_null() || payload.options.is_object()) {
            return Err(EngineError::malformed("'options' must be an object"));
        }

        let start: MockStart = serde_json::from_value(payload.start.clone())
            .map_err(|e| EngineError::malformed(format!("invalid 'start': {e}")))?;

        if start.function.is_empty() {
            return Err(EngineError::malformed("'start.function' is required"));
        }
        let function = MockFunction::parse(&start.function).ok_or_else(|| {
            EngineError::malformed(format!("unknown function '{}'", start.function))
        })?;
        if start.delay > MAX_DELAY_MS {
            return Err(EngineError::malformed(format!(
                "'start.delay' must not exceed {MAX_DELAY_MS} ms"
            )));
        }

        Ok(Self {
            function,
            delay: Duration::from_millis(start.delay),
            argument: start.argument,
        })
    }
}

struct Mount {
    mount_point: String,
    path: PathBuf,
    mutable: bool,
}

/// Sandbox of the mock engine.
pub struct MockSandbox {
    id: String,
    context: SandboxContext,
    program: MockProgram,
    lifecycle: Lifecycle,
    root_path: PathBuf,
    root: Mutex<Option<TempDir>>,
    mounts: Mutex<Vec<Mount>>,
    proxies: Mutex<HashMap<String, Arc<dyn ProxyHandler>>>,
    env: Mutex<BTreeMap<String, String>>,
    stop: CancellationToken,
    tracker: Arc<ExecutionTracker>,
}

impl MockSandbox {
    fn attach(
        &self,
        mount_point: &str,
        volume: &Arc<dyn Volume>,
        mutable: bool,
    ) -> Result<(), EngineError> {
        self.lifecycle.begin_attach()?;
        let mock = volume
            .as_any()
            .downcast_ref::<MockVolume>()
            .ok_or_else(|| EngineError::internal("volume was not created by the mock engine"))?;
        if mock.is_disposed() {
            return Err(EngineError::Usage(format!(
                "volume {} is already disposed",
                mock.id
            )));
        }
        let mount_point = relative_path(mount_point)?;

        let mut mounts = self.mounts.lock().unwrap_or_else(|p| p.into_inner());
        if mounts.iter().any(|m| m.mount_point == mount_point) {
            return Err(EngineError::malformed(format!(
                "mount point '{mount_point}' is used twice"
            )));
        }
        mounts.push(Mount {
            mount_point,
            path: mock.path().to_path_buf(),
            mutable,
        });
        Ok(())
    }

    /// Resolves `<mount>/<file>` against the attached mounts.
    fn resolve_mount(&self, target: &str) -> Option<(PathBuf, bool)> {
        let mounts = self.mounts.lock().unwrap_or_else(|p| p.into_inner());
        mounts.iter().find_map(|m| {
            let rest = target.strip_prefix(&m.mount_point)?.strip_prefix('/')?;
            Some((m.path.join(rest), m.mutable))
        })
    }

    async fn append_log(&self, line: &str) -> Result<(), EngineError> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root_path.join("task.log"))
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    async fn run_function(&self) -> Result<bool, EngineError> {
        let argument = self.program.argument.as_str();
        match self.program.function {
            MockFunction::True => Ok(true),
            MockFunction::False => Ok(false),
            MockFunction::WriteFiles => {
                let output = self.root_path.join("output");
                tokio::fs::create_dir_all(output.join("nested")).await?;
                tokio::fs::write(output.join("result.txt"), argument).await?;
                tokio::fs::write(output.join("nested").join("data.txt"), argument).await?;
                Ok(true)
            }
            MockFunction::WriteVolume => match self.resolve_mount(argument) {
                Some((path, true)) => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, b"hello-cache").await?;
                    Ok(true)
                }
                Some((_, false)) => {
                    self.append_log(&format!("'{argument}' is mounted read-only"))
                        .await?;
                    Ok(false)
                }
                None => {
                    self.append_log(&format!("no mount for '{argument}'")).await?;
                    Ok(false)
                }
            },
            MockFunction::ReadVolume => match self.resolve_mount(argument) {
                Some((path, _)) => match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        self.append_log(&content).await?;
                        Ok(true)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e.into()),
                },
                None => Ok(false),
            },
            MockFunction::PingProxy => {
                let (name, path) = argument.split_once('/').unwrap_or((argument, ""));
                let handler = self
                    .proxies
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(name)
                    .cloned();
                let Some(handler) = handler else {
                    self.append_log(&format!("no proxy named '{name}'")).await?;
                    return Ok(false);
                };
                let response = handler.handle(ProxyRequest::get(format!("/{path}"))).await;
                let output = self.root_path.join("output");
                tokio::fs::create_dir_all(&output).await?;
                tokio::fs::write(output.join("proxy.txt"), &response.body).await?;
                Ok(response.status == 200)
            }
            MockFunction::PrintEnv => {
                let lines: String = self
                    .env
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .iter()
                    .map(|(name, value)| format!("{name}={value}\n"))
                    .collect();
                let output = self.root_path.join("output");
                tokio::fs::create_dir_all(&output).await?;
                tokio::fs::write(output.join("env.txt"), lines).await?;
                Ok(true)
            }
            MockFunction::MalformedPayloadAfterStart => Err(EngineError::malformed(
                "payload rejected after execution started",
            )),
            MockFunction::InternalError => {
                Err(EngineError::internal("mock internal error requested"))
            }
        }
    }

    fn extraction_path(&self, path: &str) -> Result<PathBuf, EngineError> {
        Ok(self.root_path.join(relative_path(path)?))
    }
}

/// Normalizes a sandbox-relative path, rejecting absolute and parent components.
fn relative_path(path: &str) -> Result<String, EngineError> {
    let trimmed = path.trim_start_matches("./").trim_end_matches('/');
    let candidate = Path::new(trimmed);
    let valid = !trimmed.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(EngineError::malformed(format!("invalid sandbox path '{path}'")));
    }
    Ok(trimmed.to_string())
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SandboxState {
        self.lifecycle.state()
    }

    async fn attach_mutable_cache(
        &self,
        mount_point: &str,
        volume: Arc<dyn Volume>,
    ) -> Result<(), EngineError> {
        self.attach(mount_point, &volume, true)
    }

    async fn attach_read_only_cache(
        &self,
        mount_point: &str,
        volume: Arc<dyn Volume>,
    ) -> Result<(), EngineError> {
        self.attach(mount_point, &volume, false)
    }

    async fn attach_proxy(
        &self,
        name: &str,
        handler: Arc<dyn ProxyHandler>,
    ) -> Result<(), EngineError> {
        self.lifecycle.begin_attach()?;
        let mut proxies = self.proxies.lock().unwrap_or_else(|p| p.into_inner());
        if proxies.contains_key(name) {
            return Err(EngineError::malformed(format!(
                "proxy '{name}' is attached twice"
            )));
        }
        proxies.insert(name.to_string(), handler);
        Ok(())
    }

    async fn set_environment_variable(&self, name: &str, value: &str) -> Result<(), EngineError> {
        self.lifecycle.begin_attach()?;
        if name.is_empty() || name.contains('=') || name.contains('\0') {
            return Err(EngineError::malformed(format!(
                "invalid environment variable name '{name}'"
            )));
        }
        let mut env = self.env.lock().unwrap_or_else(|p| p.into_inner());
        if env.contains_key(name) {
            return Err(EngineError::malformed(format!(
                "environment variable '{name}' has already been set"
            )));
        }
        env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn execute(&self) -> Result<bool, EngineError> {
        self.lifecycle.begin_execute()?;
        let _guard = self.tracker.enter();

        if !self.program.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.program.delay) => {}
                _ = self.stop.cancelled() => {
                    self.lifecycle.finish_execute(false);
                    return Err(EngineError::Aborted);
                }
            }
        }
        if self.stop.is_cancelled() {
            self.lifecycle.finish_execute(false);
            return Err(EngineError::Aborted);
        }

        self.append_log(&format!(
            "task {} run {} executing '{}'",
            self.context.task_id,
            self.context.run_id,
            self.program.function.as_str()
        ))
        .await?;

        let result = self.run_function().await;
        let state = self.lifecycle.finish_execute(matches!(result, Ok(true)));
        if state == SandboxState::Aborted {
            return Err(EngineError::Aborted);
        }
        result
    }

    async fn new_shell(&self) -> Result<Box<dyn Shell>, EngineError> {
        self.lifecycle.ensure_executing()?;
        Ok(Box::new(MockShell::spawn()))
    }

    async fn stop(&self) -> Result<(), EngineError> {
        if self.lifecycle.abort() {
            debug!(sandbox_id = %self.id, "Mock sandbox stopped");
        }
        self.stop.cancel();
        Ok(())
    }

    async fn extract_file(&self, path: &str) -> Result<ArtifactReader, EngineError> {
        self.lifecycle.ensure_extractable()?;
        let full = self.extraction_path(path)?;
        match tokio::fs::File::open(&full).await {
            Ok(file) if full.is_file() => Ok(ArtifactReader::new(path, file)),
            Ok(_) => Err(EngineError::ResourceNotFound(format!("'{path}' is not a file"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ResourceNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn extract_folder(&self, path: &str) -> Result<ArtifactStream, EngineError> {
        self.lifecycle.ensure_extractable()?;
        let base = self.extraction_path(path)?;
        if !base.is_dir() {
            return Err(EngineError::ResourceNotFound(path.to_string()));
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(|e| EngineError::internal(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| EngineError::internal(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            files.push((relative, entry.path().to_path_buf()));
        }

        let stream = async_stream::stream! {
            for (relative, absolute) in files {
                match tokio::fs::File::open(&absolute).await {
                    Ok(file) => yield Ok::<_, EngineError>(ArtifactReader::new(relative, file)),
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn archive_sandbox(&self) -> Result<ArtifactReader, EngineError> {
        self.lifecycle.ensure_extractable()?;
        let root = self.root_path.clone();
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &root)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| EngineError::internal(format!("archive task failed: {e}")))??;
        Ok(ArtifactReader::new("sandbox.tar", std::io::Cursor::new(data)))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.stop.cancel();
        if !self.lifecycle.close() {
            return Ok(());
        }
        self.mounts.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.proxies.lock().unwrap_or_else(|p| p.into_inner()).clear();
        let root = self.root.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(root) = root {
            root.close()?;
        }
        debug!(sandbox_id = %self.id, "Mock sandbox closed");
        Ok(())
    }
}

impl Drop for MockSandbox {
    fn drop(&mut self) {
        if self.lifecycle.state() != SandboxState::Closed {
            warn!(sandbox_id = %self.id, "Sandbox was not closed properly");
        }
    }
}

/// Shell that echoes stdin back to stdout.
pub struct MockShell {
    stdin: Option<tokio::io::DuplexStream>,
    stdout: Option<tokio::io::DuplexStream>,
    stderr: Option<tokio::io::DuplexStream>,
    abort: CancellationToken,
    task: Option<JoinHandle<bool>>,
}

impl MockShell {
    fn spawn() -> Self {
        let (stdin_writer, mut stdin_reader) = tokio::io::duplex(4096);
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(4096);
        let (_stderr_writer, stderr_reader) = tokio::io::duplex(64);
        let abort = CancellationToken::new();

        let token = abort.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = tokio::io::copy(&mut stdin_reader, &mut stdout_writer) => result.is_ok(),
                _ = token.cancelled() => false,
            }
        });

        Self {
            stdin: Some(stdin_writer),
            stdout: Some(stdout_reader),
            stderr: Some(stderr_reader),
            abort,
            task: Some(task),
        }
    }
}

#[async_trait]
impl Shell for MockShell {
    fn stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>)
    }

    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn set_size(&self, _columns: u16, _rows: u16) -> Result<(), EngineError> {
        Ok(())
    }

    async fn abort(&self) -> Result<(), EngineError> {
        self.abort.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> Result<bool, EngineError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| EngineError::internal(format!("shell task failed: {e}"))),
            None => Err(EngineError::Usage("shell was already waited on".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context() -> SandboxContext {
        SandboxContext {
            task_id: "task-1".to_string(),
            run_id: 0,
            provisioner_id: "prov".to_string(),
            worker_type: "mock-worker".to_string(),
            worker_group: "group".to_string(),
            worker_id: "worker-1".to_string(),
        }
    }

    fn payload(start: Value) -> SandboxPayload {
        SandboxPayload {
            start,
            options: json!({}),
        }
    }

    async fn read_all(mut artifact: ArtifactReader) -> String {
        let mut out = String::new();
        artifact.reader.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_empty_start_is_malformed() {
        let engine = MockEngine::default();
        let err = engine
            .new_sandbox(&payload(json!({})), &context())
            .await
            .err()
            .unwrap();
        assert!(err.is_malformed_payload());
    }

    #[tokio::test]
    async fn test_unknown_function_and_bad_delay_are_malformed() {
        let engine = MockEngine::default();
        for start in [
            json!({"function": "explode"}),
            json!({"function": "true", "delay": MAX_DELAY_MS + 1}),
            json!({"function": "true", "unexpected": 1}),
            json!("true"),
        ] {
            let err = engine
                .new_sandbox(&payload(start.clone()), &context())
                .await
                .err()
                .unwrap();
            assert!(err.is_malformed_payload(), "{start} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_execute_true_and_false() {
        let engine = MockEngine::default();

        let sandbox = engine
            .new_sandbox(&payload(json!({"function": "true"})), &context())
            .await
            .unwrap();
        assert!(sandbox.execute().await.unwrap());
        assert_eq!(sandbox.state(), SandboxState::Succeeded);
        sandbox.close().await.unwrap();

        let sandbox = engine
            .new_sandbox(&payload(json!({"function": "false"})), &context())
            .await
            .unwrap();
        assert!(!sandbox.execute().await.unwrap());
        assert_eq!(sandbox.state(), SandboxState::Failed);
        sandbox.close().await.unwrap();

        assert_eq!(engine.executions_started(), 2);
        assert_eq!(engine.executing(), 0);
    }

    #[tokio::test]
    async fn test_attach_after_execute_is_rejected() {
        let engine = MockEngine::default();
        let volume = engine.new_cache_folder().await.unwrap();
        let sandbox = engine
            .new_sandbox(&payload(json!({"function": "true"})), &context())
            .await
            .unwrap();
        sandbox.execute().await.unwrap();

        let err = sandbox
            .attach_mutable_cache("cache", Arc::clone(&volume))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Usage(_)));

        let err = sandbox
            .attach_proxy("p", Arc::new(NullProxy))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Usage(_)));

        sandbox.close().await.unwrap();
        volume.dispose().await.unwrap();
    }

    struct NullProxy;

    #[async_trait]
    impl ProxyHandler for NullProxy {
        async fn handle(&self, request: ProxyRequest) -> crate::engine::ProxyResponse {
            crate::engine::ProxyResponse::json(200, &json!({"path": request.path}))
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_delay() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "true", "delay": 60_000})),
                &context(),
            )
            .await
            .unwrap();

        let running = Arc::clone(&sandbox);
        let handle = tokio::spawn(async move { running.execute().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sandbox.stop().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert_eq!(sandbox.state(), SandboxState::Aborted);
        assert!(matches!(
            sandbox.extract_file("task.log").await,
            Err(EngineError::Aborted)
        ));
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read_volume_across_sandboxes() {
        let engine = MockEngine::default();
        let volume = engine.new_cache_folder().await.unwrap();

        let writer = engine
            .new_sandbox(
                &payload(json!({"function": "write-volume", "argument": "cache/data.txt"})),
                &context(),
            )
            .await
            .unwrap();
        writer
            .attach_mutable_cache("cache", Arc::clone(&volume))
            .await
            .unwrap();
        assert!(writer.execute().await.unwrap());
        writer.close().await.unwrap();

        let reader = engine
            .new_sandbox(
                &payload(json!({"function": "read-volume", "argument": "cache/data.txt"})),
                &context(),
            )
            .await
            .unwrap();
        reader
            .attach_read_only_cache("cache", Arc::clone(&volume))
            .await
            .unwrap();
        assert!(reader.execute().await.unwrap());
        let log = read_all(reader.extract_file("task.log").await.unwrap()).await;
        assert!(log.contains("hello-cache"));
        reader.close().await.unwrap();

        volume.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_to_read_only_mount_fails_task() {
        let engine = MockEngine::default();
        let volume = engine.new_cache_folder().await.unwrap();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "write-volume", "argument": "cache/x"})),
                &context(),
            )
            .await
            .unwrap();
        sandbox
            .attach_read_only_cache("cache", Arc::clone(&volume))
            .await
            .unwrap();
        assert!(!sandbox.execute().await.unwrap());
        sandbox.close().await.unwrap();
        volume.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_dispose_is_idempotent() {
        let engine = MockEngine::default();
        let volume = engine.new_volume().await.unwrap();
        let path = volume
            .as_any()
            .downcast_ref::<MockVolume>()
            .unwrap()
            .path()
            .to_path_buf();
        assert!(path.exists());

        volume.dispose().await.unwrap();
        assert!(volume.is_disposed());
        assert!(!path.exists());
        volume.dispose().await.unwrap();
        assert!(volume.is_disposed());
    }

    #[tokio::test]
    async fn test_extract_folder_and_file() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "write-files", "argument": "payload-data"})),
                &context(),
            )
            .await
            .unwrap();
        assert!(matches!(
            sandbox.extract_file("output/result.txt").await,
            Err(EngineError::Usage(_))
        ));
        assert!(sandbox.execute().await.unwrap());

        let file = sandbox.extract_file("output/result.txt").await.unwrap();
        assert_eq!(read_all(file).await, "payload-data");

        let mut stream = sandbox.extract_folder("output").await.unwrap();
        let mut paths = Vec::new();
        while let Some(artifact) = stream.next().await {
            let artifact = artifact.unwrap();
            paths.push(artifact.path.clone());
            assert_eq!(read_all(artifact).await, "payload-data");
        }
        assert_eq!(paths, vec!["nested/data.txt", "result.txt"]);

        assert!(matches!(
            sandbox.extract_file("missing.txt").await,
            Err(EngineError::ResourceNotFound(_))
        ));
        assert!(matches!(
            sandbox.extract_file("../etc/passwd").await,
            Err(EngineError::MalformedPayload(_))
        ));

        let mut archive = sandbox.archive_sandbox().await.unwrap();
        let mut bytes = Vec::new();
        archive.reader.read_to_end(&mut bytes).await.unwrap();
        let mut tar = tar::Archive::new(std::io::Cursor::new(bytes));
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("output/result.txt")));

        sandbox.close().await.unwrap();
        sandbox.close().await.unwrap();
        assert!(matches!(
            sandbox.extract_file("output/result.txt").await,
            Err(EngineError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_ping_proxy_writes_response() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "ping-proxy", "argument": "info/status"})),
                &context(),
            )
            .await
            .unwrap();
        sandbox.attach_proxy("info", Arc::new(NullProxy)).await.unwrap();
        assert!(sandbox.execute().await.unwrap());
        let body = read_all(sandbox.extract_file("output/proxy.txt").await.unwrap()).await;
        assert_eq!(body, r#"{"path":"/status"}"#);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_print_env_lists_variables() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(&payload(json!({"function": "print-env"})), &context())
            .await
            .unwrap();
        sandbox.set_environment_variable("TASK_ID", "task-1").await.unwrap();
        sandbox.set_environment_variable("LANG", "C").await.unwrap();

        let err = sandbox.set_environment_variable("LANG", "en").await.unwrap_err();
        assert!(err.is_malformed_payload());
        let err = sandbox.set_environment_variable("A=B", "x").await.unwrap_err();
        assert!(err.is_malformed_payload());

        assert!(sandbox.execute().await.unwrap());
        let env = read_all(sandbox.extract_file("output/env.txt").await.unwrap()).await;
        assert_eq!(env, "LANG=C\nTASK_ID=task-1\n");

        let err = sandbox.set_environment_variable("LATE", "1").await.unwrap_err();
        assert!(matches!(err, EngineError::Usage(_)));
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_functions() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "malformed-payload-after-start"})),
                &context(),
            )
            .await
            .unwrap();
        assert!(sandbox.execute().await.unwrap_err().is_malformed_payload());
        sandbox.close().await.unwrap();

        let sandbox = engine
            .new_sandbox(&payload(json!({"function": "internal-error"})), &context())
            .await
            .unwrap();
        assert!(!sandbox.execute().await.unwrap_err().is_recoverable());
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shell_echoes_while_executing() {
        let engine = MockEngine::default();
        let sandbox = engine
            .new_sandbox(
                &payload(json!({"function": "true", "delay": 60_000})),
                &context(),
            )
            .await
            .unwrap();
        assert!(sandbox.new_shell().await.is_err());

        let running = Arc::clone(&sandbox);
        let handle = tokio::spawn(async move { running.execute().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut shell = sandbox.new_shell().await.unwrap();
        let mut stdin = shell.stdin().unwrap();
        let mut stdout = shell.stdout().unwrap();
        stdin.write_all(b"echo").await.unwrap();
        drop(stdin);
        let mut echoed = String::new();
        stdout.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "echo");
        assert!(shell.wait().await.unwrap());

        sandbox.stop().await.unwrap();
        assert!(handle.await.unwrap().is_err());
        sandbox.close().await.unwrap();
    }
}
