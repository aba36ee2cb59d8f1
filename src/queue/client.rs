//! Remote queue protocol and its HTTP implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::SandboxPayload;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Errors returned by the remote queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Network failure or server-side error. Safe to retry.
    #[error("Transient queue error: {0}")]
    Transient(String),

    #[error("Rate limited by queue: {0}")]
    RateLimited(String),

    /// The claim on this run is no longer held by this worker.
    #[error("Claim lost: {0}")]
    ClaimLost(String),

    #[error("Queue rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode queue response: {0}")]
    Decode(String),

    #[error("Run {0} is already resolved")]
    AlreadyResolved(RunKey),

    #[error("No claim is tracked for run {0}")]
    UnknownClaim(RunKey),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl QueueError {
    /// Returns true for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_) | QueueError::RateLimited(_))
    }

    pub fn is_claim_lost(&self) -> bool {
        matches!(self, QueueError::ClaimLost(_))
    }

    fn from_status(status: StatusCode, message: String) -> Self {
        match status.as_u16() {
            409 => QueueError::ClaimLost(message),
            429 => QueueError::RateLimited(message),
            500..=599 => QueueError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
            code => QueueError::Rejected {
                status: code,
                message,
            },
        }
    }
}

/// Identity of one run of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunKey {
    pub task_id: String,
    pub run_id: u32,
}

impl RunKey {
    pub fn new(task_id: impl Into<String>, run_id: u32) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.run_id)
    }
}

/// Who is claiming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,
}

/// Queue credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
}

impl Credentials {
    /// Access token with everything but the edges masked.
    pub fn access_token_masked(&self) -> String {
        let token = &self.access_token;
        let len = token.chars().count();
        if len <= 8 {
            "*".repeat(len)
        } else {
            let head: String = token.chars().take(4).collect();
            let mut tail: Vec<char> = token.chars().rev().take(4).collect();
            tail.reverse();
            format!("{head}...{}", tail.into_iter().collect::<String>())
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &self.access_token_masked())
            .finish()
    }
}

/// A run waiting to be claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub task_id: String,
    pub run_id: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    File,
    Folder,
    /// The whole sandbox filesystem; `path` is ignored.
    Archive,
}

/// An artifact the task asks the worker to upload after execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactSpec {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub optional: bool,
}

/// A named cache the task wants mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSpec {
    pub name: String,
    pub mount_point: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub optional: bool,
}

/// Task definition returned with a successful claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default)]
    pub payload: SandboxPayload,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    /// Environment variables for the sandbox.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Maximum execution time in seconds.
    #[serde(default)]
    pub max_run_time: Option<u64>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub taken_until: DateTime<Utc>,
    pub task: TaskDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimResponse {
    pub taken_until: DateTime<Utc>,
}

/// Why a run was resolved as an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionReason {
    MalformedPayload,
    InternalError,
    ClaimExpired,
    WorkerShutdown,
}

impl ExceptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionReason::MalformedPayload => "malformed-payload",
            ExceptionReason::InternalError => "internal-error",
            ExceptionReason::ClaimExpired => "claim-expired",
            ExceptionReason::WorkerShutdown => "worker-shutdown",
        }
    }
}

/// Final result of a run as reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Completed,
    Failed,
    Exception(ExceptionReason),
}

impl Outcome {
    /// `completed`, `failed` or `exception`.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Exception(_) => "exception",
        }
    }

    pub fn reason(&self) -> Option<ExceptionReason> {
        match self {
            Outcome::Exception(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exception(reason) => write!(f, "exception/{}", reason.as_str()),
            other => f.write_str(other.label()),
        }
    }
}

/// The operations a worker needs from the remote queue.
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    /// Next run eligible for this worker type, if any.
    async fn next_pending(
        &self,
        provisioner_id: &str,
        worker_type: &str,
    ) -> Result<Option<PendingTask>, QueueError>;

    async fn claim(
        &self,
        run: &RunKey,
        worker: &WorkerIdentity,
    ) -> Result<ClaimResponse, QueueError>;

    async fn reclaim(&self, run: &RunKey) -> Result<ReclaimResponse, QueueError>;

    async fn resolve(&self, run: &RunKey, outcome: Outcome) -> Result<(), QueueError>;
}

#[derive(Serialize)]
struct ExceptionBody {
    reason: ExceptionReason,
}

/// Queue client speaking JSON over HTTP.
pub struct HttpQueue {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpQueue {
    /// Creates a client for the queue at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Client` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self, QueueError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| QueueError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn run_url(&self, run: &RunKey, action: &str) -> String {
        format!(
            "{}/task/{}/runs/{}/{}",
            self.base_url,
            urlencoding::encode(&run.task_id),
            run.run_id,
            action
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, QueueError> {
        let response = request
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.access_token),
            )
            .send()
            .await
            .map_err(|e| QueueError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        Err(QueueError::from_status(status, message))
    }
}

#[async_trait]
impl RemoteQueue for HttpQueue {
    async fn next_pending(
        &self,
        provisioner_id: &str,
        worker_type: &str,
    ) -> Result<Option<PendingTask>, QueueError> {
        let url = format!(
            "{}/pending/{}/{}",
            self.base_url,
            urlencoding::encode(provisioner_id),
            urlencoding::encode(worker_type)
        );
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let pending = response
            .json::<PendingTask>()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok(Some(pending))
    }

    async fn claim(
        &self,
        run: &RunKey,
        worker: &WorkerIdentity,
    ) -> Result<ClaimResponse, QueueError> {
        let request = self.client.post(self.run_url(run, "claim")).json(worker);
        self.send(request)
            .await?
            .json::<ClaimResponse>()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))
    }

    async fn reclaim(&self, run: &RunKey) -> Result<ReclaimResponse, QueueError> {
        let request = self
            .client
            .post(self.run_url(run, "reclaim"))
            .json(&serde_json::json!({}));
        self.send(request)
            .await?
            .json::<ReclaimResponse>()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))
    }

    async fn resolve(&self, run: &RunKey, outcome: Outcome) -> Result<(), QueueError> {
        let request = match outcome {
            Outcome::Completed => self
                .client
                .post(self.run_url(run, "completed"))
                .json(&serde_json::json!({})),
            Outcome::Failed => self
                .client
                .post(self.run_url(run, "failed"))
                .json(&serde_json::json!({})),
            Outcome::Exception(reason) => self
                .client
                .post(self.run_url(run, "exception"))
                .json(&ExceptionBody { reason }),
        };
        self.send(request).await?;
        Ok(())
    }
}
