//! sandbox_worker: claims tasks from a remote queue and runs each one in a
//! sandbox built by a pluggable engine.
//!
//! The [`manager::TaskManager`] bounds concurrent runs by capacity, the
//! [`queue::QueueService`] keeps claims alive and reports outcomes, and an
//! [`engine::Engine`] builds sandboxes and cache folders.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;

// Re-export commonly used types
pub use config::{load_config, load_config_file, WorkerConfig};
pub use engine::{Capabilities, Capability, Engine, EngineRegistry, Sandbox, Volume};
pub use error::{ArtifactError, ConfigError, EngineError, RegistryError};
pub use manager::{ManagerError, ManagerStats, TaskManager, TaskManagerConfig};
pub use queue::{Outcome, QueueError, QueueService, RemoteQueue, Task};
