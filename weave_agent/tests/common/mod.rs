//! Common test utilities for WeaveKit integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use weave_agent::{
    AgentRegistry, ExecutionError, Executor, FnExecutor, RetryPolicy, SchedulerConfig,
    WorkflowManager,
};
use weave_core::FileWorkflowStore;

/// One executor call as observed by a [`Recorder`].
#[derive(Clone, Debug)]
pub struct Call {
    /// Last line of the instruction, which tests set to the task id
    pub task: String,
    /// Full instruction received
    pub instruction: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Records every call made to executors built from it.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.task == task).collect()
    }

    /// Highest number of calls that overlapped in time.
    pub fn peak_concurrency(&self) -> usize {
        let calls = self.calls();
        calls
            .iter()
            .map(|c| {
                calls
                    .iter()
                    .filter(|o| o.started <= c.started && c.started < o.finished)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    /// Executor that sleeps for `delay`, then fails for tasks listed in
    /// `failing` and echoes the task id otherwise.
    pub fn executor(&self, name: &str, delay: Duration, failing: &[&str]) -> Arc<dyn Executor> {
        let calls = Arc::clone(&self.calls);
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
        Arc::new(FnExecutor::new(name, move |instruction: String| {
            let calls = Arc::clone(&calls);
            let failing = failing.clone();
            async move {
                let started = Instant::now();
                tokio::time::sleep(delay).await;
                let task = instruction.lines().last().unwrap_or_default().to_string();
                calls.lock().unwrap().push(Call {
                    task: task.clone(),
                    instruction: instruction.clone(),
                    started,
                    finished: Instant::now(),
                });
                if failing.contains(&task) {
                    Err(ExecutionError::failed(format!("{task} always fails")))
                } else {
                    Ok(format!("output of {task}"))
                }
            }
        }))
    }
}

/// Registry with the given executors and `general` as default.
pub fn registry(executors: Vec<(&str, Arc<dyn Executor>)>) -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new("general");
    for (capability, executor) in executors {
        registry.register_instance(capability, executor);
    }
    Arc::new(registry)
}

/// Manager backed by a file store in a temporary directory.
pub async fn test_manager(
    registry: Arc<AgentRegistry>,
    config: SchedulerConfig,
) -> (TempDir, Arc<WorkflowManager>, Arc<FileWorkflowStore>) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileWorkflowStore::open(temp.path().join("workflows")).await.unwrap());
    let manager = WorkflowManager::new(store.clone(), registry, RetryPolicy::default(), config);
    (temp, Arc::new(manager), store)
}

/// Attempts per task id from a report, keyed by plain strings.
pub fn attempts(report: &weave_agent::RunReport) -> HashMap<String, u32> {
    report
        .attempts
        .iter()
        .map(|(id, n)| (id.to_string(), *n))
        .collect()
}
