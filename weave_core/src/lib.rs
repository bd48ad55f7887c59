//! WeaveKit core - task graphs, workflow records and persistence.
//!
//! This crate holds everything about a workflow that does not involve running
//! it: the data model, structural validation of the dependency graph, and the
//! keyed store that records each workflow.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use weave_core::{TaskGraph, TaskSpec};
//!
//! let tasks = vec![
//!     TaskSpec::new("collect", "Collect logs"),
//!     TaskSpec::new("report", "Write the report").depends_on("collect"),
//! ];
//! let graph = TaskGraph::build(&tasks)?;
//! println!("levels: {:?}", graph.levels());
//! # Ok::<(), weave_core::ValidationError>(())
//! ```
//!
//! # Modules
//!
//! - [`types`]: Workflow and task data model
//! - [`error`]: Validation and persistence errors
//! - [`graph`]: Dependency graph validation and analysis
//! - [`storage`]: Workflow record persistence

pub mod error;
pub mod types;

pub mod graph;
pub mod storage;

// Re-export commonly used types
pub use error::{StoreError, ValidationError};
pub use graph::TaskGraph;
pub use storage::{FileWorkflowStore, MemoryWorkflowStore, WorkflowStore};
pub use types::{
    Task, TaskId, TaskMetadata, TaskSpec, TaskStatus, Workflow, WorkflowStatus, WorkflowSummary,
};

/// Validates a full task list.
///
/// Runs the per-task checks of [`TaskSpec::validate`] and then the graph
/// checks of [`TaskGraph::build`], returning the built graph on success.
pub fn validate_tasks(tasks: &[TaskSpec]) -> Result<TaskGraph, ValidationError> {
    if tasks.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }
    for task in tasks {
        task.validate()?;
    }
    TaskGraph::build(tasks)
}
