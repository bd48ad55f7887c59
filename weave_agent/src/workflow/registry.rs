//! Capability to executor resolution.
//!
//! The registry holds a constructor per capability label and a process-wide
//! cache of the instances it has built. It is created once, wrapped in an
//! `Arc`, and handed to every scheduler run.
//!
//! # Example
//!
//! ```ignore
//! use weave_agent::workflow::registry::AgentRegistry;
//! use weave_agent::workflow::executor::EchoExecutor;
//!
//! let mut registry = AgentRegistry::new("general");
//! registry.register("general", || Arc::new(EchoExecutor));
//! let executor = registry.get("browser")?; // falls back to "general"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use weave_core::types::DEFAULT_CAPABILITY;

use crate::workflow::executor::{
    ExecutionError, Executor, ExecutorConcurrency, ExecutorKind,
};

/// Builds a fresh executor instance for a capability.
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn Executor> + Send + Sync>;

/// Wraps an executor that cannot take overlapping calls.
struct SerializedExecutor {
    inner: Arc<dyn Executor>,
    gate: tokio::sync::Mutex<()>,
}

#[async_trait]
impl Executor for SerializedExecutor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, instruction: &str) -> Result<String, ExecutionError> {
        let _guard = self.gate.lock().await;
        self.inner.execute(instruction).await
    }

    fn concurrency(&self) -> ExecutorConcurrency {
        ExecutorConcurrency::Serialized
    }
}

/// Resolves capability labels to cached executor instances.
pub struct AgentRegistry {
    factories: HashMap<String, ExecutorFactory>,
    cache: Mutex<HashMap<String, Arc<dyn Executor>>>,
    default_capability: String,
}

impl AgentRegistry {
    /// Creates an empty registry that falls back to `default_capability`.
    pub fn new(default_capability: impl Into<String>) -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
            default_capability: default_capability.into(),
        }
    }

    /// Builds a registry from config entries.
    ///
    /// The default capability resolves to an echo executor when the entries
    /// do not configure it.
    pub fn from_kinds(
        default_capability: impl Into<String>,
        kinds: &HashMap<String, ExecutorKind>,
    ) -> Self {
        let mut registry = Self::new(default_capability);
        for (capability, kind) in kinds {
            let kind = kind.clone();
            registry.register(capability.clone(), move || kind.build());
        }
        if !registry.is_registered(&registry.default_capability) {
            let default = registry.default_capability.clone();
            registry.register(default, || ExecutorKind::Echo.build());
        }
        registry
    }

    /// Registers a constructor for `capability`.
    ///
    /// Replaces any previous constructor and drops a cached instance built by it.
    pub fn register<F>(&mut self, capability: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        let capability = capability.into();
        self.cache_mut().remove(&capability);
        self.factories.insert(capability, Arc::new(factory));
    }

    /// Registers a ready-made instance for `capability`.
    pub fn register_instance(&mut self, capability: impl Into<String>, executor: Arc<dyn Executor>) {
        self.register(capability, move || Arc::clone(&executor));
    }

    /// Returns the executor for `capability`, constructing it on first use.
    ///
    /// Unknown capabilities resolve to the default capability with a warning.
    ///
    /// # Returns
    ///
    /// - `Ok(executor)` - Cached instance for the capability or the default
    /// - `Err(ExecutionError)` - `Unavailable` when neither is registered
    pub fn get(&self, capability: &str) -> Result<Arc<dyn Executor>, ExecutionError> {
        let resolved = if self.factories.contains_key(capability) {
            capability
        } else {
            tracing::warn!(
                capability,
                fallback = %self.default_capability,
                "unknown capability, using default executor"
            );
            self.default_capability.as_str()
        };

        let factory = self.factories.get(resolved).ok_or_else(|| {
            ExecutionError::unavailable(format!(
                "no executor registered for '{capability}' or default '{}'",
                self.default_capability
            ))
        })?;

        // Construct under the lock so racing callers share one instance
        let mut cache = self.cache_mut();
        if let Some(executor) = cache.get(resolved) {
            return Ok(Arc::clone(executor));
        }

        let built = factory();
        let executor: Arc<dyn Executor> = match built.concurrency() {
            ExecutorConcurrency::Shared => built,
            ExecutorConcurrency::Serialized => Arc::new(SerializedExecutor {
                inner: built,
                gate: tokio::sync::Mutex::new(()),
            }),
        };
        tracing::debug!(capability = resolved, executor = executor.name(), "constructed executor");
        cache.insert(resolved.to_string(), Arc::clone(&executor));
        Ok(executor)
    }

    /// Registered capability labels, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.factories.keys().cloned().collect();
        caps.sort();
        caps
    }

    /// Returns true if `capability` has a constructor.
    pub fn is_registered(&self, capability: &str) -> bool {
        self.factories.contains_key(capability)
    }

    /// Capability used for unknown labels.
    pub fn default_capability(&self) -> &str {
        &self.default_capability
    }

    fn cache_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Executor>>> {
        // A panic while holding the lock leaves the map itself intact
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::from_kinds(DEFAULT_CAPABILITY, &HashMap::new())
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("capabilities", &self.capabilities())
            .field("default_capability", &self.default_capability)
            .finish()
    }
}
