//! Error types for WeaveKit core.

use crate::types::TaskId;

/// A task list that cannot become a workflow.
///
/// Every variant names the invariant that was violated. Validation errors
/// are always raised while a workflow is being created, never while it runs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The task list was empty.
    #[error("workflow must contain at least one task")]
    EmptyWorkflow,

    /// Workflow identifier is not usable as a record key.
    #[error("invalid workflow id '{0}': expected [A-Za-z0-9_-]+")]
    InvalidWorkflowId(String),

    /// Task identifier does not match `^[A-Za-z0-9_-]+$`.
    #[error("invalid task id '{0}': expected [A-Za-z0-9_-]+")]
    InvalidTaskId(String),

    /// Task has an empty description.
    #[error("task '{0}' has an empty description")]
    EmptyDescription(TaskId),

    /// Task has an empty capability label.
    #[error("task '{0}' has an empty capability")]
    EmptyCapability(TaskId),

    /// Priority outside `1..=10`.
    #[error("task '{task_id}' has priority {priority}, expected 1..=10")]
    InvalidPriority {
        /// Offending task
        task_id: TaskId,
        /// Declared priority
        priority: u8,
    },

    /// Two tasks share one identifier.
    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(TaskId),

    /// Task lists itself as a dependency.
    #[error("task '{0}' depends on itself")]
    SelfDependency(TaskId),

    /// Dependency refers to a task that is not in the workflow.
    #[error("task '{task_id}' depends on unknown task '{missing}'")]
    MissingDependency {
        /// Task declaring the dependency
        task_id: TaskId,
        /// Referenced identifier that does not exist
        missing: TaskId,
    },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<TaskId>),
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors raised by workflow persistence.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// No record exists for the workflow.
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// Workflow identifier cannot be mapped to a record.
    #[error("invalid workflow id: {0}")]
    InvalidId(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}
