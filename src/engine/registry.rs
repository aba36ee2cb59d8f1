//! Explicit engine registry.
//!
//! Engines are registered from a list built at startup. Registering the same
//! name twice is a configuration error reported before any task is claimed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::mock::MockEngineProvider;
use super::Engine;
use crate::error::{ConfigError, RegistryError};

/// Builds an engine from its section of the worker configuration.
pub trait EngineProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns `ConfigError` if `config` does not match the engine's schema.
    fn create(&self, config: &Value) -> Result<Arc<dyn Engine>, ConfigError>;
}

/// Name to provider map.
#[derive(Default)]
pub struct EngineRegistry {
    providers: BTreeMap<&'static str, Box<dyn EngineProvider>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every engine compiled into this binary.
    pub fn with_defaults() -> Result<Self, RegistryError> {
        Self::from_providers(vec![Box::new(MockEngineProvider) as Box<dyn EngineProvider>])
    }

    pub fn from_providers(
        providers: impl IntoIterator<Item = Box<dyn EngineProvider>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for provider in providers {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Box<dyn EngineProvider>) -> Result<(), RegistryError> {
        let name = provider.name();
        if self.providers.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind: "engine",
                name: name.to_string(),
            });
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn EngineProvider, RegistryError> {
        self.providers
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| RegistryError::Unknown {
                kind: "engine",
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered providers in name order.
    pub fn providers(&self) -> impl Iterator<Item = &dyn EngineProvider> {
        self.providers.values().map(|p| p.as_ref())
    }

    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn Engine>, ConfigError> {
        let engine = self.get(name)?.create(config)?;
        tracing::debug!(engine = name, "Engine created");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_contain_mock() {
        let registry = EngineRegistry::with_defaults().unwrap();
        assert!(registry.contains("mock"));
        assert_eq!(registry.providers().count(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = EngineRegistry::from_providers(vec![
            Box::new(MockEngineProvider) as Box<dyn EngineProvider>,
            Box::new(MockEngineProvider),
        ]);
        assert_eq!(
            result.err(),
            Some(RegistryError::Duplicate {
                kind: "engine",
                name: "mock".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_engine() {
        let registry = EngineRegistry::with_defaults().unwrap();
        let err = registry.create("qemu", &Value::Null).err().unwrap();
        assert!(matches!(
            err,
            ConfigError::Registry(RegistryError::Unknown { .. })
        ));
    }

    #[test]
    fn test_create_mock_engine() {
        let registry = EngineRegistry::with_defaults().unwrap();
        let engine = registry
            .create("mock", &serde_json::json!({"maxConcurrency": 2}))
            .unwrap();
        assert_eq!(engine.name(), "mock");
        assert_eq!(engine.capabilities().max_concurrency, Some(2));
    }
}
