//! Workflow lifecycle facade.
//!
//! [`WorkflowManager`] is the single entry point callers use: it validates
//! and persists new workflows, starts and resumes runs, and answers status
//! queries from the store. Everything it needs is injected at construction;
//! there is no process-global state.
//!
//! # Example
//!
//! ```ignore
//! let manager = WorkflowManager::from_config(&EngineConfig::default()).await?;
//!
//! manager.create("wf1", vec![
//!     TaskSpec::new("a", "Collect the data"),
//!     TaskSpec::new("b", "Summarize it").depends_on("a"),
//! ]).await?;
//!
//! let report = manager.start("wf1").await?;
//! assert_eq!(report.status, WorkflowStatus::Completed);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::task::JoinHandle;
use weave_core::error::{StoreError, ValidationError};
use weave_core::storage::{FileWorkflowStore, WorkflowStore};
use weave_core::types::{
    is_valid_identifier, Task, TaskSpec, TaskStatus, Workflow, WorkflowStatus, WorkflowSummary,
};

use crate::config::EngineConfig;
use crate::workflow::registry::AgentRegistry;
use crate::workflow::retry::RetryPolicy;
use crate::workflow::scheduler::{RunError, RunHandle, RunReport, Scheduler, SchedulerConfig};
use crate::workflow::yaml::{load_definition_from_file, DefinitionError};

/// Result length shown by [`WorkflowManager::status_for_display`].
pub const DISPLAY_RESULT_LIMIT: usize = 200;

/// Errors returned by the facade.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// No workflow with this id
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// A workflow with this id already exists
    #[error("duplicate id: {0}")]
    Duplicate(String),

    /// The workflow is running or has already run
    #[error("already started: {0}")]
    AlreadyStarted(String),

    /// Only workflows persisted as `running` can be resumed
    #[error("cannot resume {0}: {reason}", reason = resume_refusal(.1))]
    NotResumable(String, WorkflowStatus),

    /// The task list is malformed
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    /// Persistence failed
    #[error("store error: {0}")]
    Store(StoreError),

    /// A task-definition document could not be loaded
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),
}

fn resume_refusal(status: &WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Created => "not started yet".to_string(),
        other => format!("already started and {other}"),
    }
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ManagerError::NotFound(id),
            StoreError::InvalidId(id) => {
                ManagerError::Validation(ValidationError::InvalidWorkflowId(id))
            }
            other => ManagerError::Store(other),
        }
    }
}

impl From<RunError> for ManagerError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Graph(e) => ManagerError::Validation(e),
            RunError::Store(e) => e.into(),
        }
    }
}

type ActiveRuns = Arc<Mutex<HashMap<String, Arc<RunHandle>>>>;

fn lock_runs(
    runs: &Mutex<HashMap<String, Arc<RunHandle>>>,
) -> MutexGuard<'_, HashMap<String, Arc<RunHandle>>> {
    runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the entry for `workflow_id` only if it still belongs to `handle`.
fn release(
    runs: &Mutex<HashMap<String, Arc<RunHandle>>>,
    workflow_id: &str,
    handle: &Arc<RunHandle>,
) {
    let mut runs = lock_runs(runs);
    if runs
        .get(workflow_id)
        .is_some_and(|current| Arc::ptr_eq(current, handle))
    {
        runs.remove(workflow_id);
    }
}

/// Claim on a workflow id held for the lifetime of one run.
///
/// Dropping the claim releases the id, including when the future driving
/// the run is dropped before it finishes.
struct ActiveRun {
    runs: ActiveRuns,
    workflow_id: String,
    handle: Arc<RunHandle>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        release(&self.runs, &self.workflow_id, &self.handle);
    }
}

/// Creates, runs and tracks workflows.
pub struct WorkflowManager {
    store: Arc<dyn WorkflowStore>,
    scheduler: Scheduler,
    /// Runs active in this process, keyed by workflow id
    active: ActiveRuns,
    /// Serializes the exists-then-save sequence of `create`
    create_lock: tokio::sync::Mutex<()>,
}

impl WorkflowManager {
    /// Creates a manager from its collaborators.
    ///
    /// # Arguments
    ///
    /// * `store` - Workflow record persistence
    /// * `registry` - Capability to executor resolution, shared by every run
    /// * `policy` - Retry and fallback decisions
    /// * `config` - Dispatch tuning
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<AgentRegistry>,
        policy: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&store), registry)
            .with_retry_policy(policy)
            .with_config(config);
        Self {
            store,
            scheduler,
            active: Arc::new(Mutex::new(HashMap::new())),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a manager backed by a file store, as described by `config`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, ManagerError> {
        let store = FileWorkflowStore::open(&config.store_dir).await?;
        tracing::debug!(store_dir = %config.store_dir.display(), "opened workflow store");
        Ok(Self::new(
            Arc::new(store),
            Arc::new(config.registry()),
            config.retry_policy(),
            config.scheduler.clone(),
        ))
    }

    /// Validates and persists a new workflow in `created` status.
    ///
    /// # Returns
    ///
    /// - `Ok(Workflow)` - The persisted record
    /// - `Err(ManagerError::Validation)` - The task list is malformed; nothing is persisted
    /// - `Err(ManagerError::Duplicate)` - The id is taken
    pub async fn create(
        &self,
        workflow_id: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<Workflow, ManagerError> {
        if !is_valid_identifier(workflow_id) {
            return Err(ValidationError::InvalidWorkflowId(workflow_id.to_string()).into());
        }
        let graph = weave_core::validate_tasks(&tasks)?;

        let _guard = self.create_lock.lock().await;
        if self.store.exists(workflow_id).await? {
            return Err(ManagerError::Duplicate(workflow_id.to_string()));
        }

        let workflow = Workflow::new(workflow_id, tasks.into_iter().map(Task::from_spec).collect());
        self.store.save(&workflow).await?;

        tracing::info!(
            workflow_id,
            tasks = workflow.tasks.len(),
            levels = graph.levels().len(),
            "workflow created"
        );
        Ok(workflow)
    }

    /// Loads a task-definition document and creates the workflow it describes.
    ///
    /// `workflow_id` overrides the id in the document; without either a
    /// fresh id is generated.
    pub async fn create_from_file(
        &self,
        path: &Path,
        workflow_id: Option<&str>,
    ) -> Result<Workflow, ManagerError> {
        let definition = load_definition_from_file(path).await?;
        let id = match workflow_id {
            Some(id) => id.to_string(),
            None => definition.workflow_id_or_generate(),
        };
        self.create(&id, definition.tasks).await
    }

    /// Runs a created workflow to completion.
    ///
    /// # Returns
    ///
    /// - `Ok(RunReport)` - The workflow reached `completed` or `failed`
    /// - `Err(ManagerError::NotFound)` - No such workflow
    /// - `Err(ManagerError::AlreadyStarted)` - It is running or already ran
    pub async fn start(&self, workflow_id: &str) -> Result<RunReport, ManagerError> {
        let (workflow, run) = self.claim(workflow_id, WorkflowStatus::Created).await?;
        self.drive(workflow, run).await
    }

    /// Starts a workflow in the background.
    ///
    /// The same checks as [`start`](Self::start) happen before this returns.
    pub async fn spawn(
        self: &Arc<Self>,
        workflow_id: &str,
    ) -> Result<JoinHandle<Result<RunReport, ManagerError>>, ManagerError> {
        let (workflow, run) = self.claim(workflow_id, WorkflowStatus::Created).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.drive(workflow, run).await }))
    }

    /// Continues a workflow persisted as `running` that no process is driving.
    ///
    /// Completed tasks keep their results. Tasks caught mid-flight are reset
    /// to `pending` and dispatched again.
    pub async fn resume(&self, workflow_id: &str) -> Result<RunReport, ManagerError> {
        let (mut workflow, run) = self.claim(workflow_id, WorkflowStatus::Running).await?;
        let mut reset = 0;
        for task in workflow.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                reset += 1;
            }
        }
        tracing::info!(workflow_id, reset, "resuming workflow");
        self.drive(workflow, run).await
    }

    /// Last persisted state of a workflow.
    pub async fn status(&self, workflow_id: &str) -> Result<Workflow, ManagerError> {
        Ok(self.store.load(workflow_id).await?)
    }

    /// Like [`status`](Self::status) with long results truncated.
    pub async fn status_for_display(&self, workflow_id: &str) -> Result<Workflow, ManagerError> {
        Ok(self.status(workflow_id).await?.display_snapshot(DISPLAY_RESULT_LIMIT))
    }

    /// Summaries of every stored workflow, oldest first.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, ManagerError> {
        Ok(self.store.list().await?)
    }

    /// Removes a workflow record.
    ///
    /// Deleting a running workflow stops further checkpoints for it; executor
    /// calls already in flight finish on their own.
    pub async fn delete(&self, workflow_id: &str) -> Result<(), ManagerError> {
        let active = self.active_runs().get(workflow_id).cloned();
        let deleted = match active {
            Some(handle) => {
                tracing::warn!(workflow_id, "deleting running workflow");
                let deleted = handle
                    .discard_and_delete(self.store.as_ref(), workflow_id)
                    .await?;
                // The discarded run no longer owns the id
                release(&self.active, workflow_id, &handle);
                deleted
            }
            None => self.store.delete(workflow_id).await?,
        };

        if !deleted {
            return Err(ManagerError::NotFound(workflow_id.to_string()));
        }
        tracing::info!(workflow_id, "workflow deleted");
        Ok(())
    }

    /// Returns true if this process is currently driving `workflow_id`.
    pub fn is_active(&self, workflow_id: &str) -> bool {
        self.active_runs().contains_key(workflow_id)
    }

    /// Registers a run for `workflow_id` if it is in `expected` status.
    ///
    /// The handle is inserted before the record is read, so of two racing
    /// callers exactly one proceeds.
    async fn claim(
        &self,
        workflow_id: &str,
        expected: WorkflowStatus,
    ) -> Result<(Workflow, ActiveRun), ManagerError> {
        let handle = Arc::new(RunHandle::new());
        {
            let mut active = self.active_runs();
            if active.contains_key(workflow_id) {
                return Err(ManagerError::AlreadyStarted(workflow_id.to_string()));
            }
            active.insert(workflow_id.to_string(), Arc::clone(&handle));
        }
        // From here on an early return releases the id
        let run = ActiveRun {
            runs: Arc::clone(&self.active),
            workflow_id: workflow_id.to_string(),
            handle,
        };

        let workflow = self.store.load(workflow_id).await?;
        if workflow.status != expected {
            return Err(match expected {
                WorkflowStatus::Created => ManagerError::AlreadyStarted(workflow_id.to_string()),
                _ => ManagerError::NotResumable(workflow_id.to_string(), workflow.status),
            });
        }
        Ok((workflow, run))
    }

    async fn drive(&self, workflow: Workflow, run: ActiveRun) -> Result<RunReport, ManagerError> {
        let result = self.scheduler.run(workflow, &run.handle).await;
        drop(run);
        result.map_err(ManagerError::from)
    }

    fn active_runs(&self) -> MutexGuard<'_, HashMap<String, Arc<RunHandle>>> {
        lock_runs(&self.active)
    }
}
