//! Config transform pipeline.
//!
//! A transform rewrites the raw configuration tree before it is deserialized
//! and validated. Transforms run in the order the config file lists them.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::env::EnvTransform;
use crate::error::{ConfigError, RegistryError};

/// A named rewrite of the raw configuration tree.
pub trait TransformProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrites `config` in place. Unsupported structure is an error.
    fn transform(&self, config: &mut Value) -> Result<(), String>;
}

/// Transforms known to this process.
#[derive(Default)]
pub struct TransformRegistry {
    providers: BTreeMap<&'static str, Box<dyn TransformProvider>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in transforms.
    pub fn with_defaults() -> Result<Self, RegistryError> {
        Self::from_providers(vec![Box::new(EnvTransform) as Box<dyn TransformProvider>])
    }

    pub fn from_providers(
        providers: impl IntoIterator<Item = Box<dyn TransformProvider>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for provider in providers {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Box<dyn TransformProvider>) -> Result<(), RegistryError> {
        let name = provider.name();
        if self.providers.contains_key(name) {
            return Err(RegistryError::Duplicate {
                kind: "config transform",
                name: name.to_string(),
            });
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.keys().copied()
    }

    /// Applies the named transforms in order.
    ///
    /// All names are checked before the first transform runs.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownTransform` for an unregistered name
    /// - `ConfigError::TransformFailed` for the first failing transform
    pub fn apply(&self, names: &[String], config: &mut Value) -> Result<(), ConfigError> {
        let providers = names
            .iter()
            .map(|name| {
                self.providers
                    .get(name.as_str())
                    .ok_or_else(|| ConfigError::UnknownTransform(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for provider in providers {
            provider
                .transform(config)
                .map_err(|reason| ConfigError::TransformFailed {
                    name: provider.name().to_string(),
                    reason,
                })?;
            debug!(transform = provider.name(), "Config transform applied");
        }
        Ok(())
    }
}

/// Replaces every object containing the key `$<key>` with `replace(object)`.
///
/// Replacements are not searched again.
pub fn replace_objects<F>(value: &mut Value, key: &str, replace: &mut F) -> Result<(), String>
where
    F: FnMut(&Map<String, Value>) -> Result<Value, String>,
{
    let marker = format!("${key}");
    replace_marked(value, &marker, replace)
}

fn replace_marked<F>(value: &mut Value, marker: &str, replace: &mut F) -> Result<(), String>
where
    F: FnMut(&Map<String, Value>) -> Result<Value, String>,
{
    if let Value::Object(map) = value {
        if map.contains_key(marker) {
            *value = replace(map)?;
            return Ok(());
        }
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                replace_marked(child, marker, replace)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                replace_marked(item, marker, replace)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl TransformProvider for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn transform(&self, config: &mut Value) -> Result<(), String> {
            replace_objects(config, "upper", &mut |map| {
                map.get("$upper")
                    .and_then(Value::as_str)
                    .map(|s| Value::String(s.to_uppercase()))
                    .ok_or_else(|| "'$upper' must be a string".to_string())
            })
        }
    }

    #[test]
    fn test_replace_objects_nested() {
        let mut config = json!({
            "a": {"$upper": "x"},
            "b": [{"$upper": "y"}, {"c": {"$upper": "z"}}],
            "d": 1
        });
        Upper.transform(&mut config).unwrap();
        assert_eq!(
            config,
            json!({"a": "X", "b": ["Y", {"c": "Z"}], "d": 1})
        );
    }

    #[test]
    fn test_replace_root_object() {
        let mut config = json!({"$upper": "root"});
        Upper.transform(&mut config).unwrap();
        assert_eq!(config, json!("ROOT"));
    }

    #[test]
    fn test_apply_in_order_and_reject_unknown() {
        let registry = TransformRegistry::from_providers(vec![
            Box::new(Upper) as Box<dyn TransformProvider>,
            Box::new(EnvTransform),
        ])
        .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["env", "upper"]);

        let mut config = json!({"name": {"$upper": "w"}});
        let err = registry
            .apply(&["upper".to_string(), "nope".to_string()], &mut config)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform(name) if name == "nope"));
        // Nothing ran because validation happens up front.
        assert_eq!(config, json!({"name": {"$upper": "w"}}));

        registry.apply(&["upper".to_string()], &mut config).unwrap();
        assert_eq!(config, json!({"name": "W"}));
    }

    #[test]
    fn test_failure_names_transform() {
        let registry =
            TransformRegistry::from_providers(vec![Box::new(Upper) as Box<dyn TransformProvider>])
                .unwrap();
        let mut config = json!({"$upper": 5});
        let err = registry.apply(&["upper".to_string()], &mut config).unwrap_err();
        assert!(matches!(err, ConfigError::TransformFailed { name, .. } if name == "upper"));
    }

    #[test]
    fn test_duplicate_transform_rejected() {
        let result = TransformRegistry::from_providers(vec![
            Box::new(EnvTransform) as Box<dyn TransformProvider>,
            Box::new(EnvTransform),
        ]);
        assert!(matches!(result, Err(RegistryError::Duplicate { .. })));
    }
}
