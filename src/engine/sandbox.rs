//! Sandbox contract and the lifecycle state cell engines build on.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use super::volume::Volume;
use super::Capability;
use crate::error::EngineError;

/// Execution state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxState {
    Created,
    Attaching,
    Executing,
    Succeeded,
    Failed,
    Aborted,
    Closed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Created => "created",
            SandboxState::Attaching => "attaching",
            SandboxState::Executing => "executing",
            SandboxState::Succeeded => "succeeded",
            SandboxState::Failed => "failed",
            SandboxState::Aborted => "aborted",
            SandboxState::Closed => "closed",
        }
    }

    /// True once execution has ended, whatever the result.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SandboxState::Succeeded | SandboxState::Failed | SandboxState::Aborted
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, readable artifact produced by extraction. Consumed once.
pub struct ArtifactReader {
    pub path: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ArtifactReader {
    pub fn new(path: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            path: path.into(),
            reader: Box::new(reader),
        }
    }
}

impl fmt::Debug for ArtifactReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactReader")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// One-shot sequence of artifacts produced by folder extraction.
pub type ArtifactStream = BoxStream<'static, Result<ArtifactReader, EngineError>>;

/// Request forwarded from inside a sandbox to a proxy handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            body: Vec::new(),
        }
    }
}

/// Response returned to the sandbox by a proxy handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: b"not found".to_vec(),
        }
    }
}

/// Handler for requests a sandbox sends to a named proxy.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn handle(&self, request: ProxyRequest) -> ProxyResponse;
}

/// Interactive channel into a running sandbox.
///
/// The pipes can each be taken once.
#[async_trait]
pub trait Shell: Send {
    fn stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;

    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    fn stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    async fn set_size(&self, _columns: u16, _rows: u16) -> Result<(), EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::Shell))
    }

    /// Kills the shell. `wait` then returns `Ok(false)`.
    async fn abort(&self) -> Result<(), EngineError>;

    /// Waits for the shell to exit and reports whether it exited cleanly.
    async fn wait(&mut self) -> Result<bool, EngineError>;
}

/// Execution context for one task run.
///
/// All methods take `&self` so that [`Sandbox::stop`] can be called while
/// another task is blocked in [`Sandbox::execute`]. Attach methods are only
/// valid before execution starts; extraction is only valid after it ends.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> SandboxState;

    async fn attach_mutable_cache(
        &self,
        _mount_point: &str,
        _volume: Arc<dyn Volume>,
    ) -> Result<(), EngineError> {
        ensure_attachable(self.state())?;
        Err(EngineError::FeatureNotSupported(Capability::MutableCache))
    }

    async fn attach_read_only_cache(
        &self,
        _mount_point: &str,
        _volume: Arc<dyn Volume>,
    ) -> Result<(), EngineError> {
        ensure_attachable(self.state())?;
        Err(EngineError::FeatureNotSupported(Capability::ReadOnlyCache))
    }

    async fn attach_proxy(
        &self,
        _name: &str,
        _handler: Arc<dyn ProxyHandler>,
    ) -> Result<(), EngineError> {
        ensure_attachable(self.state())?;
        Err(EngineError::FeatureNotSupported(Capability::Proxy))
    }

    /// Sets an environment variable for the task. Setting a name twice is a
    /// malformed payload.
    async fn set_environment_variable(&self, _name: &str, _value: &str) -> Result<(), EngineError> {
        ensure_attachable(self.state())?;
        Err(EngineError::FeatureNotSupported(Capability::Environment))
    }

    /// Runs the task to completion.
    ///
    /// `Ok(false)` means the task itself failed. An error means the sandbox
    /// could not run it.
    async fn execute(&self) -> Result<bool, EngineError>;

    async fn new_shell(&self) -> Result<Box<dyn Shell>, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::Shell))
    }

    /// Requests early termination. Safe to call concurrently with `execute`.
    async fn stop(&self) -> Result<(), EngineError>;

    async fn extract_file(&self, _path: &str) -> Result<ArtifactReader, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::ExtractFile))
    }

    async fn extract_folder(&self, _path: &str) -> Result<ArtifactStream, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::ExtractFolder))
    }

    /// Captures the whole sandbox filesystem as one tar stream.
    async fn archive_sandbox(&self) -> Result<ArtifactReader, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::ArchiveSandbox))
    }

    /// Releases every resource held by the sandbox. Idempotent.
    async fn close(&self) -> Result<(), EngineError>;
}

fn ensure_attachable(state: SandboxState) -> Result<(), EngineError> {
    match state {
        SandboxState::Created | SandboxState::Attaching => Ok(()),
        SandboxState::Closed => Err(EngineError::Terminated),
        other => Err(EngineError::Usage(format!(
            "cannot attach resources to a sandbox in state '{other}'"
        ))),
    }
}

/// Thread-safe sandbox state machine.
///
/// Engines embed one per sandbox and call it at the top of each contract
/// method, which keeps the transition rules in one place.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<SandboxState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SandboxState::Created),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SandboxState {
        *self.lock()
    }

    /// Enters `Attaching`, rejecting the call once execution has started.
    pub fn begin_attach(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        match *state {
            SandboxState::Aborted => Err(EngineError::Aborted),
            other => {
                ensure_attachable(other)?;
                *state = SandboxState::Attaching;
                Ok(())
            }
        }
    }

    /// Enters `Executing`. A sandbox executes at most once.
    pub fn begin_execute(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        match *state {
            SandboxState::Created | SandboxState::Attaching => {
                *state = SandboxState::Executing;
                Ok(())
            }
            SandboxState::Aborted => Err(EngineError::Aborted),
            SandboxState::Closed => Err(EngineError::Terminated),
            other => Err(EngineError::Usage(format!(
                "sandbox cannot execute from state '{other}'"
            ))),
        }
    }

    /// Records the end of execution. An abort that raced the run wins.
    pub fn finish_execute(&self, succeeded: bool) -> SandboxState {
        let mut state = self.lock();
        if *state == SandboxState::Executing {
            *state = if succeeded {
                SandboxState::Succeeded
            } else {
                SandboxState::Failed
            };
        }
        *state
    }

    /// Moves to `Aborted`. Returns false if execution already ended or the
    /// sandbox is closed.
    pub fn abort(&self) -> bool {
        let mut state = self.lock();
        match *state {
            SandboxState::Created | SandboxState::Attaching | SandboxState::Executing => {
                *state = SandboxState::Aborted;
                true
            }
            _ => false,
        }
    }

    /// Moves to `Closed`. Returns true only for the first call.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if *state == SandboxState::Closed {
            return false;
        }
        *state = SandboxState::Closed;
        true
    }

    pub fn ensure_executing(&self) -> Result<(), EngineError> {
        match self.state() {
            SandboxState::Executing => Ok(()),
            SandboxState::Closed => Err(EngineError::Terminated),
            other => Err(EngineError::Usage(format!(
                "sandbox is not executing (state '{other}')"
            ))),
        }
    }

    /// Artifacts exist only after a run that was not aborted.
    pub fn ensure_extractable(&self) -> Result<(), EngineError> {
        match self.state() {
            SandboxState::Succeeded | SandboxState::Failed => Ok(()),
            SandboxState::Aborted => Err(EngineError::Aborted),
            SandboxState::Closed => Err(EngineError::Terminated),
            other => Err(EngineError::Usage(format!(
                "artifacts are not available in state '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SandboxState::Created);

        lifecycle.begin_attach().unwrap();
        lifecycle.begin_attach().unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Attaching);

        lifecycle.begin_execute().unwrap();
        assert!(lifecycle.ensure_executing().is_ok());
        assert_eq!(lifecycle.finish_execute(true), SandboxState::Succeeded);
        assert!(lifecycle.ensure_extractable().is_ok());

        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert_eq!(lifecycle.state(), SandboxState::Closed);
    }

    #[test]
    fn test_attach_after_execute_is_usage_error() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_execute().unwrap();
        assert!(matches!(lifecycle.begin_attach(), Err(EngineError::Usage(_))));

        lifecycle.finish_execute(false);
        assert!(matches!(lifecycle.begin_attach(), Err(EngineError::Usage(_))));
    }

    #[test]
    fn test_execute_only_once() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_execute().unwrap();
        lifecycle.finish_execute(true);
        assert!(matches!(lifecycle.begin_execute(), Err(EngineError::Usage(_))));
    }

    #[test]
    fn test_abort_before_execute_blocks_execution() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.abort());
        assert!(matches!(lifecycle.begin_execute(), Err(EngineError::Aborted)));
        assert!(matches!(lifecycle.ensure_extractable(), Err(EngineError::Aborted)));
    }

    #[test]
    fn test_abort_during_execution_wins_over_result() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_execute().unwrap();
        assert!(lifecycle.abort());
        assert_eq!(lifecycle.finish_execute(true), SandboxState::Aborted);
        assert!(!lifecycle.abort());
    }

    #[test]
    fn test_extraction_requires_finished_run() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.ensure_extractable(), Err(EngineError::Usage(_))));
        lifecycle.close();
        assert!(matches!(lifecycle.ensure_extractable(), Err(EngineError::Terminated)));
        assert!(matches!(lifecycle.begin_attach(), Err(EngineError::Terminated)));
    }
}
