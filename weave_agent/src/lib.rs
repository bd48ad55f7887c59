//! WeaveKit agent layer - running dependency-aware task workflows.
//!
//! This crate turns validated workflows from `weave_core` into executor calls:
//!
//! - Registry: resolve a capability label to a cached executor
//! - Retry: decide between another attempt, a fallback capability, or failure
//! - Scheduler: dispatch ready tasks concurrently and propagate results
//! - Manager: create, start, inspect and delete workflows
//!
//! # Example
//!
//! ```ignore
//! use weave_agent::{EngineConfig, WorkflowManager};
//! use weave_core::TaskSpec;
//!
//! let manager = WorkflowManager::from_config(&EngineConfig::default()).await?;
//! manager.create("wf1", vec![TaskSpec::new("a", "Say hello")]).await?;
//! let report = manager.start("wf1").await?;
//! ```

pub mod cli;
pub mod config;
pub mod workflow;

pub use config::{ConfigError, EngineConfig};
pub use workflow::executor::{
    CommandExecutor, EchoExecutor, ExecutionError, ExecutionErrorKind, Executor,
    ExecutorConcurrency, ExecutorKind, FnExecutor,
};
pub use workflow::manager::{ManagerError, WorkflowManager};
pub use workflow::registry::AgentRegistry;
pub use workflow::retry::{AdaptiveController, DispatchMode, RetryConfig, RetryPolicy};
pub use workflow::scheduler::{CheckpointMode, RunReport, Scheduler, SchedulerConfig};
