//! Worker configuration.
//!
//! A config file is YAML with two top-level keys:
//!
//! ```yaml
//! transforms: [env]
//! config:
//!   engine: mock
//!   engines: {mock: {}}
//!   queueBaseUrl: https://queue.example.com/v1
//!   credentials: {clientId: worker, accessToken: {$env: QUEUE_TOKEN}}
//!   provisionerId: local
//!   workerType: mock-worker
//!   workerGroup: local
//! ```
//!
//! Loading parses the YAML, runs the listed transforms over `config`, then
//! deserializes and validates the result. A failing transform aborts loading
//! before validation.

pub mod env;
pub mod transform;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineRegistry;
use crate::error::ConfigError;
use crate::manager::TaskManagerConfig;
use crate::queue::{Credentials, QueueServiceConfig, RetryPolicy, WorkerIdentity};

pub use env::EnvTransform;
pub use transform::{replace_objects, TransformProvider, TransformRegistry};

fn default_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_max_capacity() -> usize {
    1
}

fn default_polling_interval() -> u64 {
    5
}

fn default_expiration_offset() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    600
}

fn default_stop_grace_period() -> u64 {
    30
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

/// Retry settings for queue calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Pauses claiming after repeated internal faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FaultConfig {
    pub threshold: u32,
    pub window_secs: u64,
    pub pause_secs: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 900,
            pause_secs: 300,
        }
    }
}

/// When the worker stops on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Stop claiming after this many claims.
    #[serde(default)]
    pub max_tasks: Option<u64>,
    /// Stop after being idle this long.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

/// Typed worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    /// Name of the engine to run tasks with.
    pub engine: String,
    /// Per-engine configuration sections.
    #[serde(default)]
    pub engines: BTreeMap<String, Value>,
    pub queue_base_url: String,
    pub credentials: Credentials,
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Seconds between polls when nothing is pending.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Seconds before claim expiry at which to reclaim.
    #[serde(default = "default_expiration_offset")]
    pub expiration_offset: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Seconds to wait for `execute` to return after `stop`.
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: u64,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub faults: FaultConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Environment variables set in every sandbox. Task `env` overrides them.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    /// Checks constraints the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let identities = [
            ("engine", &self.engine),
            ("queueBaseUrl", &self.queue_base_url),
            ("credentials.clientId", &self.credentials.client_id),
            ("provisionerId", &self.provisioner_id),
            ("workerType", &self.worker_type),
            ("workerGroup", &self.worker_group),
            ("workerId", &self.worker_id),
        ];
        for (field, value) in identities {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("'{field}' must not be empty")));
            }
        }
        if !self.queue_base_url.starts_with("http://") && !self.queue_base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "'queueBaseUrl' must be an http(s) URL".to_string(),
            ));
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::Validation(
                "'maxCapacity' must be at least 1".to_string(),
            ));
        }
        if self.expiration_offset == 0 {
            return Err(ConfigError::Validation(
                "'expirationOffset' must be greater than 0".to_string(),
            ));
        }
        if self.polling_interval == 0 {
            return Err(ConfigError::Validation(
                "'pollingInterval' must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "'retry.maxAttempts' must be at least 1".to_string(),
            ));
        }
        if !self.engines.contains_key(&self.engine) {
            return Err(ConfigError::Validation(format!(
                "missing 'engines.{}' section for the selected engine",
                self.engine
            )));
        }
        Ok(())
    }

    /// Checks that the selected engine is compiled in.
    pub fn validate_engine(&self, engines: &EngineRegistry) -> Result<(), ConfigError> {
        engines.get(&self.engine)?;
        Ok(())
    }

    /// Section of `engines` for the selected engine.
    pub fn engine_config(&self) -> &Value {
        self.engines.get(&self.engine).unwrap_or(&Value::Null)
    }

    pub fn worker_identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            provisioner_id: self.provisioner_id.clone(),
            worker_type: self.worker_type.clone(),
            worker_group: self.worker_group.clone(),
            worker_id: self.worker_id.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn queue_service_config(&self) -> QueueServiceConfig {
        QueueServiceConfig::new(self.worker_identity())
            .with_expiration_offset(Duration::from_secs(self.expiration_offset))
            .with_retry(self.retry_policy())
    }

    pub fn task_manager_config(&self) -> TaskManagerConfig {
        let mut config = TaskManagerConfig::new(self.max_capacity)
            .with_poll_interval(Duration::from_secs(self.polling_interval))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
            .with_stop_grace(Duration::from_secs(self.stop_grace_period))
            .with_fault_policy(
                self.faults.threshold,
                Duration::from_secs(self.faults.window_secs),
                Duration::from_secs(self.faults.pause_secs),
            );
        if let Some(max_tasks) = self.lifecycle.max_tasks {
            config = config.with_max_tasks(max_tasks);
        }
        if let Some(idle) = self.lifecycle.idle_timeout_secs {
            config = config.with_idle_timeout(Duration::from_secs(idle));
        }
        config.with_env(self.env.clone())
    }
}

/// Parses a config document, applies its transforms and validates the result.
///
/// # Errors
///
/// Returns `ConfigError` for malformed YAML, an unknown or failing transform,
/// a schema mismatch or a failed validation.
pub fn load_config(text: &str, transforms: &TransformRegistry) -> Result<WorkerConfig, ConfigError> {
    let document: Value = serde_yaml::from_str(text)?;
    let Value::Object(mut document) = document else {
        return Err(ConfigError::Document(
            "top level must be a mapping".to_string(),
        ));
    };

    let names = match document.remove("transforms") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok(name),
                other => Err(ConfigError::Document(format!(
                    "transform names must be strings, found {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ConfigError::Document(
                "'transforms' must be a list".to_string(),
            ))
        }
    };

    let mut config = document
        .remove("config")
        .ok_or_else(|| ConfigError::Document("missing 'config' section".to_string()))?;
    if let Some(key) = document.keys().next() {
        return Err(ConfigError::Document(format!(
            "unexpected top-level key '{key}'"
        )));
    }
    if !config.is_object() {
        return Err(ConfigError::Document("'config' must be a mapping".to_string()));
    }

    transforms.apply(&names, &mut config)?;

    let config: WorkerConfig = serde_json::from_value(config)?;
    config.validate()?;
    Ok(config)
}

/// Reads and loads a config file.
pub async fn load_config_file(
    path: &Path,
    transforms: &TransformRegistry,
) -> Result<WorkerConfig, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    load_config(&text, transforms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
config:
  engine: mock
  engines:
    mock: {}
  queueBaseUrl: https://queue.example.com/v1
  credentials:
    clientId: worker
    accessToken: secret-token
  provisionerId: local
  workerType: mock-worker
  workerGroup: local
  workerId: worker-1
"#;

    fn registry() -> TransformRegistry {
        TransformRegistry::with_defaults().unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config(MINIMAL, &registry()).unwrap();
        assert_eq!(config.engine, "mock");
        assert_eq!(config.max_capacity, 1);
        assert_eq!(config.polling_interval, 5);
        assert_eq!(config.expiration_offset, 300);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.lifecycle, LifecycleConfig::default());
        assert!(config.engine_config().is_object());
        assert!(config.validate_engine(&EngineRegistry::with_defaults().unwrap()).is_ok());
    }

    #[test]
    fn test_env_transform_applied_before_schema() {
        std::env::set_var("SANDBOX_WORKER_TEST_TOKEN", "from-env");
        std::env::set_var("SANDBOX_WORKER_TEST_CAPACITY", "3");
        let text = r#"
transforms: [env]
config:
  engine: mock
  engines: {mock: {maxConcurrency: 2}}
  queueBaseUrl: https://queue.example.com/v1
  credentials:
    clientId: worker
    accessToken: {$env: SANDBOX_WORKER_TEST_TOKEN}
  provisionerId: local
  workerType: mock-worker
  workerGroup: local
  maxCapacity: {$env: SANDBOX_WORKER_TEST_CAPACITY, type: number}
"#;
        let config = load_config(text, &registry()).unwrap();
        assert_eq!(config.credentials.access_token, "from-env");
        assert_eq!(config.max_capacity, 3);
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_failing_transform_aborts_before_validation() {
        // maxCapacity 0 would fail validation; the transform error must win.
        let text = r#"
transforms: [env]
config:
  engine: mock
  maxCapacity: 0
  token: {$env: SANDBOX_WORKER_TEST_NEVER_SET_EITHER}
"#;
        let err = load_config(text, &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::TransformFailed { name, .. } if name == "env"));
    }

    #[test]
    fn test_unknown_transform() {
        let text = format!("transforms: [packet]\n{}", MINIMAL.trim_start());
        let err = load_config(&text, &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform(name) if name == "packet"));
    }

    #[test]
    fn test_document_shape_errors() {
        assert!(matches!(
            load_config("- a\n- b\n", &registry()),
            Err(ConfigError::Document(_))
        ));
        assert!(matches!(
            load_config("transforms: []\n", &registry()),
            Err(ConfigError::Document(_))
        ));
        assert!(matches!(
            load_config("transforms: env\nconfig: {}\n", &registry()),
            Err(ConfigError::Document(_))
        ));
        assert!(matches!(
            load_config("config: {}\nextra: 1\n", &registry()),
            Err(ConfigError::Document(_))
        ));
    }

    #[test]
    fn test_schema_and_validation_errors() {
        let unknown_field = MINIMAL.replace("workerId: worker-1", "workerId: worker-1\n  bogus: 1");
        assert!(matches!(
            load_config(&unknown_field, &registry()),
            Err(ConfigError::Schema(_))
        ));

        let zero = MINIMAL.replace("workerId: worker-1", "workerId: worker-1\n  maxCapacity: 0");
        assert!(matches!(
            load_config(&zero, &registry()),
            Err(ConfigError::Validation(_))
        ));

        let no_section = MINIMAL.replace("    mock: {}", "    other: {}");
        assert!(matches!(
            load_config(&no_section, &registry()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_runtime_configs() {
        let config = load_config(MINIMAL, &registry()).unwrap();
        let queue = config.queue_service_config();
        assert_eq!(queue.expiration_offset, Duration::from_secs(300));
        assert_eq!(queue.worker.worker_id, "worker-1");

        let manager = config.task_manager_config();
        assert_eq!(manager.max_capacity, 1);
        assert_eq!(manager.poll_interval, Duration::from_secs(5));
        assert_eq!(manager.max_tasks, None);
    }

    #[test]
    fn test_partial_blocks_keep_defaults() {
        let text = MINIMAL.replace(
            "workerId: worker-1",
            "workerId: worker-1\n  retry: {maxAttempts: 3}\n  faults: {pauseSecs: 60}\n  env: {INSTANCE_TYPE: small}",
        );
        let config = load_config(&text, &registry()).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, RetryConfig::default().initial_delay_ms);
        assert_eq!(config.faults.threshold, FaultConfig::default().threshold);
        assert_eq!(config.faults.pause_secs, 60);

        let manager = config.task_manager_config();
        assert_eq!(manager.fault_pause, Duration::from_secs(60));
        assert_eq!(manager.env.get("INSTANCE_TYPE").map(String::as_str), Some("small"));
    }

    #[tokio::test]
    async fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yml");
        tokio::fs::write(&path, MINIMAL).await.unwrap();
        let config = load_config_file(&path, &registry()).await.unwrap();
        assert_eq!(config.worker_type, "mock-worker");

        let missing = load_config_file(&dir.path().join("nope.yml"), &registry()).await;
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
