//! Cache folders and volumes.
//!
//! Storage objects are created by an engine independently of any sandbox
//! and may be attached to several sandboxes over their lifetime. The object
//! does not police exclusive writers; the cache pool does that.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    /// Persistent, reused across task runs.
    CacheFolder,
    /// Scratch storage.
    Volume,
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeKind::CacheFolder => f.write_str("cache-folder"),
            VolumeKind::Volume => f.write_str("volume"),
        }
    }
}

/// A mountable storage handle.
#[async_trait]
pub trait Volume: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> VolumeKind;

    fn is_disposed(&self) -> bool;

    /// Lets an engine recover its concrete type when the volume is attached.
    fn as_any(&self) -> &dyn Any;

    /// Releases the underlying storage. Calling it again is a no-op.
    async fn dispose(&self) -> Result<(), EngineError>;
}

impl fmt::Debug for dyn Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
