//! Core types used across WeaveKit.
//!
//! A [`Workflow`] owns an insertion-ordered set of [`Task`]s. Tasks are created
//! from planner-facing [`TaskSpec`] descriptors and then only mutated by the
//! scheduler driving the workflow's run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Capability used when a descriptor does not name one.
pub const DEFAULT_CAPABILITY: &str = "general";

/// Priority used when a descriptor does not declare one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Metadata key holding the per-task timeout in seconds.
pub const META_TIMEOUT_SECONDS: &str = "timeout_seconds";

/// Metadata key holding the per-task retry budget override.
pub const META_MAX_RETRIES: &str = "max_retries";

/// Returns true if `id` matches `^[A-Za-z0-9_-]+$`.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Unique identifier for a task within one workflow.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the TaskId and returns the underlying string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of an individual task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for dependencies or dispatch
    Pending,
    /// An executor call is in flight
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error, or blocked by a failed dependency
    Failed,
}

impl TaskStatus {
    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of a workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Validated and persisted, not yet started
    Created,
    /// A scheduler run is in progress
    Running,
    /// Every task completed
    Completed,
    /// At least one task ended failed
    Failed,
}

impl WorkflowStatus {
    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Free-form execution hints attached to a task.
///
/// Two keys are understood by the engine: `timeout_seconds` and
/// `max_retries`. Everything else is carried through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskMetadata(BTreeMap<String, serde_json::Value>);

impl TaskMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key, returning self for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Inserts a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Per-task timeout from `timeout_seconds`.
    ///
    /// Non-numeric, zero and negative values are ignored.
    pub fn timeout(&self) -> Option<Duration> {
        self.0
            .get(META_TIMEOUT_SECONDS)
            .and_then(serde_json::Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Retry budget override from `max_retries`.
    pub fn max_retries(&self) -> Option<u32> {
        self.0
            .get(META_MAX_RETRIES)
            .and_then(serde_json::Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    }

    /// Returns true if no keys are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn default_capability() -> String {
    DEFAULT_CAPABILITY.to_string()
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// Planner-facing task descriptor.
///
/// This is what callers submit to `create`; the engine turns it into a
/// [`Task`] in `pending` status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique identifier within the workflow
    pub task_id: TaskId,
    /// Instruction passed to the executor
    pub description: String,
    /// Executor selector
    #[serde(default = "default_capability")]
    pub capability: String,
    /// Tasks that must complete first
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 1 (highest) to 10 (lowest)
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Execution hints
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskSpec {
    /// Creates a descriptor with default capability, priority and no dependencies.
    pub fn new(task_id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            capability: default_capability(),
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            metadata: TaskMetadata::default(),
        }
    }

    /// Adds a dependency.
    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Sets the capability label.
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets a metadata key.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Checks the per-field invariants of a descriptor.
    ///
    /// Graph-level invariants (duplicates, dangling references, cycles) are
    /// checked by [`TaskGraph::build`](crate::graph::TaskGraph::build).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_identifier(self.task_id.as_str()) {
            return Err(ValidationError::InvalidTaskId(self.task_id.to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription(self.task_id.clone()));
        }
        if self.capability.trim().is_empty() {
            return Err(ValidationError::EmptyCapability(self.task_id.clone()));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(ValidationError::InvalidPriority {
                task_id: self.task_id.clone(),
                priority: self.priority,
            });
        }
        Ok(())
    }
}

/// A unit of work and its live execution state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the workflow
    pub task_id: TaskId,
    /// Instruction passed to the executor
    pub description: String,
    /// Executor selector
    pub capability: String,
    /// Tasks that must complete first, in declared order
    pub dependencies: Vec<TaskId>,
    /// 1 (highest) to 10 (lowest)
    pub priority: u8,
    /// Current status
    pub status: TaskStatus,
    /// Executor output, present only when completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure message, present only when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retry attempts made
    #[serde(default)]
    pub retry_count: u32,
    /// Execution hints
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl Task {
    /// Creates a pending task from a descriptor.
    ///
    /// Repeated dependency entries are collapsed, keeping first occurrence order.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let mut dependencies: Vec<TaskId> = Vec::with_capacity(spec.dependencies.len());
        for dep in spec.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Self {
            task_id: spec.task_id,
            description: spec.description,
            capability: spec.capability,
            dependencies,
            priority: spec.priority,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            metadata: spec.metadata,
        }
    }

    /// Marks the task as running.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
    }

    /// Marks the task as completed with `result`.
    pub fn complete(&mut self, result: String) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
    }

    /// Marks the task as failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
    }

    /// Returns true if the task reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Short listing entry for a workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow identifier
    pub workflow_id: String,
    /// Current workflow status
    pub status: WorkflowStatus,
    /// Total number of tasks
    pub task_count: usize,
    /// Tasks in `completed`
    pub completed: usize,
    /// Tasks in `failed`
    pub failed: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A named collection of tasks plus aggregate status.
///
/// This is also the persisted record: field names and status values are the
/// durable contract read by other tooling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier
    pub workflow_id: String,
    /// Aggregate status
    pub status: WorkflowStatus,
    /// Set at creation
    pub created_at: DateTime<Utc>,
    /// Set once when the run begins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once when the workflow becomes terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Tasks keyed by id, in submission order
    #[serde(with = "task_list")]
    pub tasks: IndexMap<TaskId, Task>,
}

impl Workflow {
    /// Creates a workflow in `created` status.
    ///
    /// The caller is responsible for validating `tasks` first.
    pub fn new(workflow_id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tasks: tasks
                .into_iter()
                .map(|task| (task.task_id.clone(), task))
                .collect(),
        }
    }

    /// Returns a task by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Returns a mutable task by id.
    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Transitions to `running`, recording `started_at` the first time.
    pub fn mark_running(&mut self) {
        self.status = WorkflowStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Number of tasks in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Returns true once every task is terminal.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }

    /// Derives the workflow status from task states.
    ///
    /// Only terminal outcomes are derived: `completed` when every task
    /// completed, `failed` when every task is terminal and at least one
    /// failed. Otherwise the status is left as is.
    pub fn recompute_status(&mut self) -> WorkflowStatus {
        if self.all_terminal() {
            self.status = if self.count(TaskStatus::Failed) == 0 {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            if self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        }
        self.status
    }

    /// Listing entry for this workflow.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            task_count: self.tasks.len(),
            completed: self.count(TaskStatus::Completed),
            failed: self.count(TaskStatus::Failed),
            created_at: self.created_at,
        }
    }

    /// Copy of the workflow with each result cut to `limit` characters.
    pub fn display_snapshot(&self, limit: usize) -> Workflow {
        let mut snapshot = self.clone();
        for task in snapshot.tasks.values_mut() {
            if let Some(result) = task.result.as_mut() {
                if result.chars().count() > limit {
                    let mut cut: String = result.chars().take(limit).collect();
                    cut.push_str("…[truncated]");
                    *result = cut;
                }
            }
        }
        snapshot
    }
}

/// Serializes the task map as an ordered JSON array.
mod task_list {
    use super::{Task, TaskId};
    use indexmap::IndexMap;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tasks: &IndexMap<TaskId, Task>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(tasks.values())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<TaskId, Task>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<Task>::deserialize(deserializer)?;
        let mut tasks = IndexMap::with_capacity(list.len());
        for task in list {
            if tasks.contains_key(&task.task_id) {
                return Err(D::Error::custom(format!(
                    "duplicate task id '{}'",
                    task.task_id
                )));
            }
            tasks.insert(task.task_id.clone(), task);
        }
        Ok(tasks)
    }
}
