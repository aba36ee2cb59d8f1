//! Remote queue integration.
//!
//! ```text
//!                 ┌──────────────┐ claim/reclaim/resolve ┌─────────────┐
//!  TaskManager ──▶│ QueueService │──────────────────────▶│ RemoteQueue │
//!                 └──────┬───────┘                       └─────────────┘
//!                        │ one timer per claim                HttpQueue
//!                        ▼                                   MemoryQueue
//!                  ClaimRecord table
//! ```

pub mod backoff;
pub mod client;
pub mod memory;
pub mod service;
pub mod task;

pub use backoff::RetryPolicy;
pub use client::{
    ArtifactKind, ArtifactSpec, CacheSpec, ClaimResponse, Credentials, ExceptionReason,
    HttpQueue, Outcome, PendingTask, QueueError, ReclaimResponse, RemoteQueue, RunKey,
    TaskDefinition, WorkerIdentity,
};
pub use memory::{MemoryQueue, QueueOperation};
pub use service::{reclaim_delay, ClaimSnapshot, QueueService, QueueServiceConfig};
pub use task::{Task, TaskStatus};
