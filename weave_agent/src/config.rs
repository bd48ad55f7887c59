//! Engine configuration.
//!
//! Loaded from a YAML file; every field has a default so an empty document
//! (or no file at all) yields a working engine that persists under
//! `.weave/workflows` and echoes instructions for the `general` capability.
//!
//! ```yaml
//! store_dir: /var/lib/weave
//! default_capability: general
//! scheduler:
//!   max_in_flight: 4
//!   adaptive: true
//!   default_task_timeout_secs: 300
//! retry:
//!   budgets: { 1: 3, 2: 2 }
//!   fallbacks: { browser: general }
//! executors:
//!   general: { kind: echo }
//!   shell: { kind: command, program: /bin/sh, args: ["-s"], serialized: true }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weave_core::types::DEFAULT_CAPABILITY;

use crate::workflow::executor::ExecutorKind;
use crate::workflow::registry::AgentRegistry;
use crate::workflow::retry::{RetryConfig, RetryPolicy};
use crate::workflow::scheduler::SchedulerConfig;

/// Environment variable overriding `store_dir`.
pub const STORE_DIR_ENV: &str = "WEAVE_STORE_DIR";

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".weave/workflows")
}

fn default_capability() -> String {
    DEFAULT_CAPABILITY.to_string()
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one record per workflow
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Capability used for unknown labels
    #[serde(default = "default_capability")]
    pub default_capability: String,
    /// Dispatch tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Retry budgets and fallbacks
    #[serde(default)]
    pub retry: RetryConfig,
    /// Executor per capability
    #[serde(default)]
    pub executors: HashMap<String, ExecutorKind>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            default_capability: default_capability(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            executors: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a YAML file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(STORE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        self
    }

    /// Builds the executor registry described by `executors`.
    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::from_kinds(self.default_capability.clone(), &self.executors)
    }

    /// Builds the retry policy described by `retry`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::scheduler::CheckpointMode;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.store_dir, PathBuf::from(".weave/workflows"));
        assert!(config.registry().is_registered("general"));
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
store_dir: /tmp/weave
default_capability: general
scheduler:
  max_in_flight: 4
  adaptive: true
  checkpoint: terminal_only
retry:
  budgets: { 1: 5 }
  fallbacks: { browser: general }
executors:
  general: { kind: echo }
  shell: { kind: command, program: /bin/sh, args: ["-s"], serialized: true }
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/weave"));
        assert_eq!(config.scheduler.max_in_flight, Some(4));
        assert!(config.scheduler.adaptive);
        assert_eq!(config.scheduler.checkpoint, CheckpointMode::TerminalOnly);
        assert_eq!(config.retry.budgets.get(&1), Some(&5));
        assert_eq!(
            config.registry().capabilities(),
            vec!["general".to_string(), "shell".to_string()]
        );
    }

    #[test]
    fn test_env_overrides_store_dir() {
        let config = EngineConfig::default().with_env_from(|key| {
            (key == STORE_DIR_ENV).then(|| "/srv/records".to_string())
        });
        assert_eq!(config.store_dir, PathBuf::from("/srv/records"));

        let untouched = EngineConfig::default().with_env_from(|_| Some(String::new()));
        assert_eq!(untouched.store_dir, default_store_dir());
    }

    #[test]
    fn test_unknown_executor_kind_rejected() {
        let err = EngineConfig::from_yaml("executors:\n  x: { kind: teleport }\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }
}
