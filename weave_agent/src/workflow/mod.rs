//! Workflow execution for multi-step agent operations.
//!
//! # Architecture
//!
//! - [`executor`]: the `Executor` contract and the built-in executors
//! - [`registry`]: capability to executor resolution with a shared cache
//! - [`retry`]: retry budgets, fallback capabilities and adaptive dispatch
//! - [`timeout`]: per-task time limits
//! - [`scheduler`]: the ready-set loop driving a single run
//! - [`manager`]: the create/start/status/list/delete facade
//! - [`yaml`]: task-definition documents
//!
//! # Execution Model
//!
//! A run repeatedly dispatches every pending task whose dependencies have
//! completed, feeding each one the results of its dependencies. Failures
//! are retried according to task priority, then tried once on a fallback
//! capability. Tasks downstream of a permanent failure are marked failed
//! without being dispatched.

pub mod executor;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod timeout;
pub mod yaml;

pub use manager::{ManagerError, WorkflowManager};
pub use scheduler::{RunReport, Scheduler};
