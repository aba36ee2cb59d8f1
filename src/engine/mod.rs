//! Execution engine abstraction.
//!
//! An [`Engine`] is the factory for one execution backend. It builds a
//! [`Sandbox`] per task run and hands out cache folders and volumes whose
//! lifetime is independent of any sandbox.
//!
//! # Sandbox lifecycle
//!
//! ```text
//! Created ──attach*──▶ Attaching ──execute──▶ Executing ──┬──▶ Succeeded ─┐
//!    │                     │                      │        ├──▶ Failed ────┼──▶ Closed
//!    └─────────────────────┴──────stop────────────┴────────┴──▶ Aborted ───┘
//! ```
//!
//! Optional features are advertised through [`Capabilities`]. Callers query
//! them before use; the default trait bodies still answer
//! [`EngineError::FeatureNotSupported`] for engines that do not override them.

pub mod mock;
pub mod registry;
pub mod sandbox;
pub mod volume;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub use mock::{MockEngine, MockEngineConfig, MockEngineProvider};
pub use registry::{EngineProvider, EngineRegistry};
pub use sandbox::{
    ArtifactReader, ArtifactStream, Lifecycle, ProxyHandler, ProxyRequest, ProxyResponse, Sandbox,
    SandboxState, Shell,
};
pub use volume::{Volume, VolumeKind};

/// Optional engine features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    CacheFolder,
    Volume,
    MutableCache,
    ReadOnlyCache,
    Proxy,
    Shell,
    ExtractFile,
    ExtractFolder,
    ArchiveSandbox,
    Environment,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::CacheFolder,
        Capability::Volume,
        Capability::MutableCache,
        Capability::ReadOnlyCache,
        Capability::Proxy,
        Capability::Shell,
        Capability::ExtractFile,
        Capability::ExtractFolder,
        Capability::ArchiveSandbox,
        Capability::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CacheFolder => "cache-folder",
            Capability::Volume => "volume",
            Capability::MutableCache => "mutable-cache",
            Capability::ReadOnlyCache => "read-only-cache",
            Capability::Proxy => "proxy",
            Capability::Shell => "shell",
            Capability::ExtractFile => "extract-file",
            Capability::ExtractFolder => "extract-folder",
            Capability::ArchiveSandbox => "archive-sandbox",
            Capability::Environment => "environment",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The feature set and limits of an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Upper bound on sandboxes this engine can execute at once.
    pub max_concurrency: Option<usize>,
    features: BTreeSet<Capability>,
}

impl Capabilities {
    /// An engine that supports nothing optional.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that supports every optional feature.
    pub fn all() -> Self {
        Self {
            max_concurrency: None,
            features: Capability::ALL.into_iter().collect(),
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.features.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.features.remove(&capability);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.features.contains(&capability)
    }

    pub fn features(&self) -> impl Iterator<Item = Capability> + '_ {
        self.features.iter().copied()
    }

    /// Fails with `FeatureNotSupported` unless `capability` is present.
    pub fn require(&self, capability: Capability) -> Result<(), EngineError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(EngineError::FeatureNotSupported(capability))
        }
    }
}

/// Engine-specific payload of a task: two opaque structured sections.
///
/// The core never looks inside; engines validate their own schema in
/// [`Engine::new_sandbox`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxPayload {
    #[serde(default)]
    pub start: Value,
    #[serde(default)]
    pub options: Value,
}

/// Identity of the task run a sandbox is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub task_id: String,
    pub run_id: u32,
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,
}

/// Factory for sandboxes and storage objects of one execution backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Registered name of the engine.
    fn name(&self) -> &str;

    /// Optional features and limits of this engine.
    fn capabilities(&self) -> Capabilities;

    /// Builds a sandbox for one task run.
    ///
    /// # Errors
    ///
    /// - `MalformedPayload` if the payload does not match the engine schema
    /// - `FeatureNotSupported` if the engine cannot run this kind of task
    async fn new_sandbox(
        &self,
        payload: &SandboxPayload,
        context: &SandboxContext,
    ) -> Result<Arc<dyn Sandbox>, EngineError>;

    /// Creates a persistent cache folder.
    async fn new_cache_folder(&self) -> Result<Arc<dyn Volume>, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::CacheFolder))
    }

    /// Creates a scratch volume.
    async fn new_volume(&self) -> Result<Arc<dyn Volume>, EngineError> {
        Err(EngineError::FeatureNotSupported(Capability::Volume))
    }

    /// Releases engine-wide resources. Called once after all sandboxes are closed.
    async fn dispose(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_builder() {
        let caps = Capabilities::new()
            .with(Capability::Shell)
            .with(Capability::Proxy)
            .with_max_concurrency(3);

        assert!(caps.supports(Capability::Shell));
        assert!(!caps.supports(Capability::MutableCache));
        assert_eq!(caps.max_concurrency, Some(3));
        assert!(caps.require(Capability::Proxy).is_ok());
        assert!(matches!(
            caps.require(Capability::Volume),
            Err(EngineError::FeatureNotSupported(Capability::Volume))
        ));
    }

    #[test]
    fn test_capabilities_all_without() {
        let caps = Capabilities::all().without(Capability::ArchiveSandbox);
        assert_eq!(caps.features().count(), Capability::ALL.len() - 1);
        assert!(!caps.supports(Capability::ArchiveSandbox));
    }

    #[test]
    fn test_payload_sections_default_to_null() {
        let payload: SandboxPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.start.is_null());
        assert!(payload.options.is_null());
    }
}
