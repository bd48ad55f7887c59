//! Ready-set scheduler that drives one workflow run to a terminal state.
//!
//! The scheduler repeatedly computes the set of pending tasks whose
//! dependencies have all completed, dispatches that set onto a `JoinSet`, and
//! applies each outcome as it comes back. Only the scheduler's own control
//! flow touches the workflow record and the results map; dispatched futures
//! receive an owned copy of what they need and hand back an outcome.
//!
//! # Execution Model
//!
//! 1. Fail every pending task that has a failed dependency
//! 2. Compute the ready set at the lowest unresolved level, ordered by
//!    priority, critical path, then submission order
//! 3. Dispatch the ready set, bounded by `max_in_flight` (one task in serial mode)
//! 4. Apply outcomes one at a time, checkpointing after each transition
//! 5. Repeat until no task is ready, then derive the workflow status
//!
//! Retries and the fallback attempt run inside the dispatched future, so a
//! task stays `running` from its first attempt until its final outcome.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use weave_core::error::{StoreError, ValidationError};
use weave_core::graph::{dispatch_order, TaskGraph};
use weave_core::storage::WorkflowStore;
use weave_core::types::{Task, TaskId, TaskStatus, Workflow, WorkflowStatus};

use crate::workflow::executor::ExecutionError;
use crate::workflow::registry::AgentRegistry;
use crate::workflow::retry::{AdaptiveController, DispatchMode, RetryPolicy};
use crate::workflow::timeout::{run_with_timeout, TaskTimeout};

/// Metadata key recording the capability used by a fallback attempt.
pub const META_FALLBACK_CAPABILITY: &str = "fallback_capability";

/// When the scheduler writes the workflow record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// After every task transition
    #[default]
    EveryTransition,
    /// Only when the run starts and when the workflow becomes terminal
    TerminalOnly,
}

fn default_window() -> usize {
    20
}

fn default_serial_below() -> f64 {
    0.7
}

fn default_concurrent_above() -> f64 {
    0.9
}

/// Scheduler tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running tasks (`None` = whole ready set)
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Enable adaptive serial/concurrent switching
    #[serde(default)]
    pub adaptive: bool,
    /// Outcomes considered by the adaptive controller
    #[serde(default = "default_window")]
    pub window: usize,
    /// Switch to serial dispatch below this success rate
    #[serde(default = "default_serial_below")]
    pub serial_below: f64,
    /// Switch back to concurrent dispatch above this success rate
    #[serde(default = "default_concurrent_above")]
    pub concurrent_above: f64,
    /// Time limit for tasks without a `timeout_seconds` hint
    #[serde(default)]
    pub default_task_timeout_secs: Option<u64>,
    /// Checkpoint frequency
    #[serde(default)]
    pub checkpoint: CheckpointMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            adaptive: false,
            window: default_window(),
            serial_below: default_serial_below(),
            concurrent_above: default_concurrent_above(),
            default_task_timeout_secs: None,
            checkpoint: CheckpointMode::default(),
        }
    }
}

/// Errors that stop a run before the workflow becomes terminal.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    /// The stored task list no longer forms a valid graph
    #[error("invalid workflow graph: {0}")]
    Graph(#[from] ValidationError),

    /// A checkpoint could not be written
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of a finished run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Workflow identifier
    pub workflow_id: String,
    /// Terminal workflow status
    pub status: WorkflowStatus,
    /// Tasks that completed
    pub completed: usize,
    /// Tasks that failed, including blocked ones
    pub failed: usize,
    /// Executor calls made per dispatched task
    pub attempts: BTreeMap<TaskId, u32>,
    /// Wall-clock duration of the run in milliseconds
    pub duration_ms: u64,
    /// Mean time a task spent executing, retries and fallback included
    #[serde(default)]
    pub average_task_ms: f64,
    /// Busy time over the capacity the run held: task time divided by
    /// wall time times the widest dispatch, `0.0` when nothing ran
    #[serde(default)]
    pub parallel_efficiency: f64,
}

/// Shared handle to an active run.
///
/// Deleting a workflow mid-run marks its handle discarded under the same lock
/// the scheduler holds while saving, so no checkpoint can land after the
/// record was removed.
#[derive(Debug, Default)]
pub struct RunHandle {
    discarded: Mutex<bool>,
}

impl RunHandle {
    /// Creates a live handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves `workflow` unless the run was discarded.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if the run was discarded and nothing was written.
    pub async fn persist(
        &self,
        store: &dyn WorkflowStore,
        workflow: &Workflow,
    ) -> Result<bool, StoreError> {
        let discarded = self.discarded.lock().await;
        if *discarded {
            return Ok(false);
        }
        store.save(workflow).await?;
        Ok(true)
    }

    /// Marks the run discarded and deletes its record.
    pub async fn discard_and_delete(
        &self,
        store: &dyn WorkflowStore,
        workflow_id: &str,
    ) -> Result<bool, StoreError> {
        let mut discarded = self.discarded.lock().await;
        *discarded = true;
        store.delete(workflow_id).await
    }

    /// Returns true once the workflow was deleted.
    pub async fn is_discarded(&self) -> bool {
        *self.discarded.lock().await
    }
}

/// Builds the instruction sent to the executor.
///
/// Each completed dependency contributes a `Results from <dep>:` section in
/// declared order. A task with no dependency results gets its bare description.
pub fn build_instruction(task: &Task, results: &HashMap<TaskId, String>) -> String {
    let sections: Vec<String> = task
        .dependencies
        .iter()
        .filter_map(|dep| {
            results
                .get(dep)
                .map(|result| format!("Results from {dep}:\n{result}"))
        })
        .collect();

    if sections.is_empty() {
        return task.description.clone();
    }
    format!("{}\n\nTask:\n{}", sections.join("\n\n"), task.description)
}

/// Work handed to a dispatched future.
struct Attempt {
    task: Task,
    instruction: String,
    timeout: Option<TaskTimeout>,
}

/// Final result of a dispatched task, applied by the scheduler.
struct Outcome {
    task_id: TaskId,
    result: Result<String, ExecutionError>,
    retry_count: u32,
    attempts: u32,
    failures: u32,
    fallback: Option<String>,
    /// Time spent on every attempt, fallback included
    busy: Duration,
}

async fn call_capability(
    registry: &AgentRegistry,
    capability: &str,
    instruction: &str,
    timeout: Option<TaskTimeout>,
) -> Result<String, ExecutionError> {
    let executor = registry.get(capability)?;
    run_with_timeout(timeout, executor.execute(instruction)).await
}

/// Runs one task through its retries and, if needed, one fallback attempt.
async fn attempt_task(
    registry: Arc<AgentRegistry>,
    policy: Arc<RetryPolicy>,
    job: Attempt,
) -> Outcome {
    let Attempt {
        mut task,
        instruction,
        timeout,
    } = job;
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut failures = 0u32;

    let error = loop {
        attempts += 1;
        tracing::debug!(
            task_id = %task.task_id,
            capability = %task.capability,
            attempt = attempts,
            "executing task"
        );

        match call_capability(&registry, &task.capability, &instruction, timeout).await {
            Ok(result) => {
                return Outcome {
                    task_id: task.task_id,
                    result: Ok(result),
                    retry_count: task.retry_count,
                    attempts,
                    failures,
                    fallback: None,
                    busy: started.elapsed(),
                };
            }
            Err(err) => {
                failures += 1;
                if !policy.should_retry(&task, &err) {
                    break err;
                }
                task.retry_count += 1;
                tracing::warn!(
                    task_id = %task.task_id,
                    retry = task.retry_count,
                    budget = policy.budget(&task),
                    error = %err,
                    "task attempt failed, retrying"
                );
                let backoff = policy.backoff();
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    };

    let Some(fallback) = policy.fallback_capability(&task).map(str::to_string) else {
        return Outcome {
            task_id: task.task_id,
            result: Err(error),
            retry_count: task.retry_count,
            attempts,
            failures,
            fallback: None,
            busy: started.elapsed(),
        };
    };

    tracing::warn!(
        task_id = %task.task_id,
        capability = %task.capability,
        fallback = %fallback,
        error = %error,
        "retries exhausted, trying fallback capability"
    );
    attempts += 1;
    let result = call_capability(&registry, &fallback, &instruction, timeout)
        .await
        .map_err(|fallback_err| {
            ExecutionError::new(
                fallback_err.kind,
                format!("{error}; fallback '{fallback}' failed: {fallback_err}"),
            )
        });
    if result.is_err() {
        failures += 1;
    }

    Outcome {
        task_id: task.task_id,
        result,
        retry_count: task.retry_count,
        attempts,
        failures,
        fallback: Some(fallback),
        busy: started.elapsed(),
    }
}

/// Drives workflow runs.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(store, registry)
///     .with_retry_policy(RetryPolicy::default())
///     .with_config(SchedulerConfig { max_in_flight: Some(4), ..Default::default() });
///
/// let report = scheduler.run(workflow, &RunHandle::new()).await?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<AgentRegistry>,
    policy: Arc<RetryPolicy>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler with the default retry policy and config.
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            store,
            registry,
            policy: Arc::new(RetryPolicy::default()),
            config: SchedulerConfig::default(),
        }
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets the scheduler config.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Scheduler config in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs `workflow` until every task is terminal.
    ///
    /// Tasks already completed keep their results and feed dependents'
    /// instructions, which is what lets a recovered workflow continue.
    ///
    /// # Returns
    ///
    /// - `Ok(RunReport)` - The run finished; the workflow status is terminal
    /// - `Err(RunError)` - The graph was invalid or a checkpoint failed
    pub async fn run(&self, mut workflow: Workflow, handle: &RunHandle) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let tasks: Vec<Task> = workflow.tasks.values().cloned().collect();
        let graph = TaskGraph::build(&tasks)?;
        let critical: HashSet<TaskId> = graph.critical_path().into_iter().collect();

        let mut progress = Progress {
            results: workflow
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .filter_map(|t| t.result.clone().map(|r| (t.task_id.clone(), r)))
                .collect(),
            adaptive: self.config.adaptive.then(|| {
                AdaptiveController::new(
                    self.config.window,
                    self.config.serial_below,
                    self.config.concurrent_above,
                )
            }),
            attempts: BTreeMap::new(),
            busy: Duration::ZERO,
            finished: 0,
            peak_in_flight: 0,
        };

        workflow.mark_running();
        self.checkpoint(&workflow, handle, true).await?;
        tracing::info!(
            workflow_id = %workflow.workflow_id,
            tasks = graph.len(),
            levels = graph.levels().len(),
            "workflow started"
        );

        loop {
            if self.block_unreachable(&mut workflow, &graph) > 0 {
                self.checkpoint(&workflow, handle, false).await?;
            }

            let mut ready = ready_set(&workflow, &graph, &critical);
            if ready.is_empty() {
                break;
            }

            let mode = progress
                .adaptive
                .as_ref()
                .map_or(DispatchMode::Concurrent, AdaptiveController::mode);
            if mode == DispatchMode::Serial {
                ready.truncate(1);
            }

            self.dispatch_round(&mut workflow, &ready, &mut progress, handle)
                .await?;
        }

        // Every pending task at the lowest open level is either ready or blocked
        debug_assert_eq!(workflow.count(TaskStatus::Pending), 0);

        let status = workflow.recompute_status();
        self.checkpoint(&workflow, handle, true).await?;

        let report = progress.into_report(&workflow, status, started.elapsed());
        match status {
            WorkflowStatus::Completed => tracing::info!(
                workflow_id = %report.workflow_id,
                completed = report.completed,
                duration_ms = report.duration_ms,
                parallel_efficiency = report.parallel_efficiency,
                "workflow completed"
            ),
            _ => tracing::warn!(
                workflow_id = %report.workflow_id,
                completed = report.completed,
                failed = report.failed,
                duration_ms = report.duration_ms,
                "workflow failed"
            ),
        }

        Ok(report)
    }

    /// Dispatches `ready` and applies each outcome as it arrives.
    async fn dispatch_round(
        &self,
        workflow: &mut Workflow,
        ready: &[TaskId],
        progress: &mut Progress,
        handle: &RunHandle,
    ) -> Result<(), RunError> {
        let limit = self
            .config
            .max_in_flight
            .unwrap_or(ready.len())
            .clamp(1, ready.len().max(1));
        progress.peak_in_flight = progress.peak_in_flight.max(limit);
        let permits = Arc::new(Semaphore::new(limit));
        let mut set = JoinSet::new();
        let mut dispatched: HashSet<TaskId> = HashSet::with_capacity(ready.len());

        for id in ready {
            let Some(task) = workflow.task_mut(id) else {
                continue;
            };
            task.start();
            let job = Attempt {
                instruction: build_instruction(task, &progress.results),
                timeout: TaskTimeout::for_task(&task.metadata, self.config.default_task_timeout_secs),
                task: task.clone(),
            };
            tracing::debug!(task_id = %id, priority = task.priority, "dispatching task");
            dispatched.insert(id.clone());

            let registry = Arc::clone(&self.registry);
            let policy = Arc::clone(&self.policy);
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                attempt_task(registry, policy, job).await
            });
        }
        self.checkpoint(workflow, handle, false).await?;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    dispatched.remove(&outcome.task_id);
                    self.apply_outcome(workflow, progress, outcome);
                    self.checkpoint(workflow, handle, false).await?;
                }
                Err(e) => {
                    tracing::error!(workflow_id = %workflow.workflow_id, error = %e, "task future aborted");
                }
            }
        }

        // Futures that panicked never reported back
        let mut lost: Vec<TaskId> = dispatched.into_iter().collect();
        lost.sort();
        for task_id in lost {
            let outcome = Outcome {
                task_id,
                result: Err(ExecutionError::failed("executor panicked")),
                retry_count: 0,
                attempts: 1,
                failures: 1,
                fallback: None,
                busy: Duration::ZERO,
            };
            self.apply_outcome(workflow, progress, outcome);
            self.checkpoint(workflow, handle, false).await?;
        }

        Ok(())
    }

    fn apply_outcome(&self, workflow: &mut Workflow, progress: &mut Progress, outcome: Outcome) {
        progress.record(&outcome);
        let Some(task) = workflow.task_mut(&outcome.task_id) else {
            return;
        };
        task.retry_count = task.retry_count.max(outcome.retry_count);
        if let Some(fallback) = outcome.fallback {
            task.metadata.insert(META_FALLBACK_CAPABILITY, fallback);
        }

        match outcome.result {
            Ok(result) => {
                tracing::info!(
                    task_id = %task.task_id,
                    attempts = outcome.attempts,
                    busy_ms = outcome.busy.as_millis() as u64,
                    "task completed"
                );
                progress.results.insert(task.task_id.clone(), result.clone());
                task.complete(result);
            }
            Err(err) => {
                tracing::warn!(
                    task_id = %task.task_id,
                    attempts = outcome.attempts,
                    error = %err,
                    "task failed"
                );
                task.fail(err.to_string());
            }
        }
    }

    /// Fails every pending task with a failed dependency, transitively.
    fn block_unreachable(&self, workflow: &mut Workflow, graph: &TaskGraph) -> usize {
        let mut blocked = 0;
        // Level order makes one pass reach the fixpoint
        for id in graph.levels().into_iter().flatten() {
            let blocker = match workflow.task(&id) {
                Some(task) if task.status == TaskStatus::Pending => task
                    .dependencies
                    .iter()
                    .find(|dep| {
                        workflow
                            .task(dep)
                            .is_some_and(|d| d.status == TaskStatus::Failed)
                    })
                    .cloned(),
                _ => None,
            };
            if let (Some(dep), Some(task)) = (blocker, workflow.task_mut(&id)) {
                tracing::warn!(task_id = %id, dependency = %dep, "task blocked by failed dependency");
                task.fail(format!("blocked by dependency '{dep}'"));
                blocked += 1;
            }
        }
        blocked
    }

    async fn checkpoint(
        &self,
        workflow: &Workflow,
        handle: &RunHandle,
        terminal: bool,
    ) -> Result<(), StoreError> {
        if terminal || self.config.checkpoint == CheckpointMode::EveryTransition {
            if !handle.persist(self.store.as_ref(), workflow).await? {
                tracing::debug!(workflow_id = %workflow.workflow_id, "run discarded, skipping checkpoint");
            }
        }
        Ok(())
    }
}

/// Pending tasks whose dependencies have all completed, in dispatch order.
///
/// Only the lowest level that still has pending tasks is considered, so a
/// level never starts before the one below it is resolved.
fn ready_set(workflow: &Workflow, graph: &TaskGraph, critical: &HashSet<TaskId>) -> Vec<TaskId> {
    let pending = || {
        workflow
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
    };
    let Some(frontier) = pending().filter_map(|t| graph.level_of(&t.task_id)).min() else {
        return Vec::new();
    };

    let mut ready: Vec<(TaskId, u8)> = pending()
        .filter(|t| graph.level_of(&t.task_id) == Some(frontier))
        .filter(|t| {
            t.dependencies.iter().all(|dep| {
                workflow
                    .task(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
        .map(|t| (t.task_id.clone(), t.priority))
        .collect();

    ready.sort_by(|a, b| dispatch_order(graph, critical, (&a.0, a.1), (&b.0, b.1)));
    ready.into_iter().map(|(id, _)| id).collect()
}

/// Mutable state of one run, owned by the scheduler's control flow.
struct Progress {
    results: HashMap<TaskId, String>,
    adaptive: Option<AdaptiveController>,
    attempts: BTreeMap<TaskId, u32>,
    busy: Duration,
    finished: u32,
    peak_in_flight: usize,
}

impl Progress {
    fn record(&mut self, outcome: &Outcome) {
        if let Some(ctl) = self.adaptive.as_mut() {
            for _ in 0..outcome.failures {
                ctl.record(false);
            }
            if outcome.result.is_ok() {
                ctl.record(true);
            }
        }
        self.attempts.insert(outcome.task_id.clone(), outcome.attempts);
        self.busy += outcome.busy;
        self.finished += 1;
    }

    fn into_report(self, workflow: &Workflow, status: WorkflowStatus, wall: Duration) -> RunReport {
        let busy_secs = self.busy.as_secs_f64();
        let average_task_ms = if self.finished == 0 {
            0.0
        } else {
            busy_secs * 1000.0 / f64::from(self.finished)
        };
        let capacity = wall.as_secs_f64() * self.peak_in_flight as f64;
        let parallel_efficiency = if capacity > 0.0 {
            (busy_secs / capacity).min(1.0)
        } else {
            0.0
        };

        RunReport {
            workflow_id: workflow.workflow_id.clone(),
            status,
            completed: workflow.count(TaskStatus::Completed),
            failed: workflow.count(TaskStatus::Failed),
            attempts: self.attempts,
            duration_ms: u64::try_from(wall.as_millis()).unwrap_or(u64::MAX),
            average_task_ms,
            parallel_efficiency,
        }
    }
}

impl RunReport {
    /// Run duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
