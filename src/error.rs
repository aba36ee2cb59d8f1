//! Error types for sandbox-worker operations.
//!
//! Defines the error types shared across subsystems:
//! - Engine and sandbox calls
//! - Configuration loading and transforms
//! - Name registries (engines, transforms)
//! - Artifact storage
//!
//! Queue and task-manager errors live next to their modules.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::Capability;

/// Errors returned by engines, sandboxes and cache/volume objects.
///
/// `MalformedPayload` and `FeatureNotSupported` are expected conditions the
/// caller is supposed to handle. Everything else is an internal fault.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Feature not supported: {0}")]
    FeatureNotSupported(Capability),

    #[error("Invalid sandbox usage: {0}")]
    Usage(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Sandbox was aborted")]
    Aborted,

    #[error("Sandbox has terminated")]
    Terminated,

    #[error("Internal engine error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a malformed-payload error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload(reason.into())
    }

    /// Shorthand for an internal fault.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    pub fn is_malformed_payload(&self) -> bool {
        matches!(self, Self::MalformedPayload(_))
    }

    pub fn is_feature_not_supported(&self) -> bool {
        matches!(self, Self::FeatureNotSupported(_))
    }

    /// Returns true for conditions the caller can degrade on or report as a
    /// task-author fault. Any other error is an internal fault.
    pub fn is_recoverable(&self) -> bool {
        self.is_malformed_payload() || self.is_feature_not_supported()
    }
}

/// Errors that can occur while loading the worker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config document: {0}")]
    Document(String),

    #[error("Unknown config transform '{0}'")]
    UnknownTransform(String),

    #[error("Config transform '{name}' failed: {reason}")]
    TransformFailed { name: String, reason: String },

    #[error("Config schema error: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("Config validation error: {0}")]
    Validation(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors raised by the name registries populated at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate {kind} '{name}' registered")]
    Duplicate { kind: &'static str, name: String },

    #[error("Unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
}

/// Errors that can occur while storing extracted artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("Artifact compression failed: {0}")]
    Compression(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_classification() {
        assert!(EngineError::malformed("bad").is_recoverable());
        assert!(EngineError::FeatureNotSupported(Capability::Shell).is_recoverable());
        assert!(!EngineError::internal("boom").is_recoverable());
        assert!(!EngineError::Aborted.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::FeatureNotSupported(Capability::MutableCache);
        assert_eq!(err.to_string(), "Feature not supported: mutable-cache");

        let err = RegistryError::Duplicate {
            kind: "engine",
            name: "mock".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate engine 'mock' registered");

        let err = ConfigError::TransformFailed {
            name: "env".to_string(),
            reason: "variable 'HOME' is not set".to_string(),
        };
        assert!(err.to_string().contains("'env' failed"));
    }
}
