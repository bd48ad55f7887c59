//! Per-task time limits.
//!
//! A task's limit comes from its `timeout_seconds` metadata hint, falling back
//! to the scheduler-wide default. An executor call that outlives its limit is
//! reported as an [`ExecutionErrorKind::Timeout`] failure and goes through the
//! normal retry policy.

use std::future::Future;
use std::time::Duration;

use weave_core::types::TaskMetadata;

use crate::workflow::executor::{ExecutionError, ExecutionErrorKind};

/// Time limit for one executor call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskTimeout(Duration);

impl TaskTimeout {
    /// Creates a new TaskTimeout with the specified duration.
    ///
    /// # Example
    ///
    /// ```
    /// use weave_agent::workflow::timeout::TaskTimeout;
    /// use std::time::Duration;
    ///
    /// let timeout = TaskTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a TaskTimeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Resolves the limit for a task.
    ///
    /// # Arguments
    ///
    /// * `metadata` - Task metadata, checked for `timeout_seconds`
    /// * `default_secs` - Scheduler-wide default, if any
    ///
    /// # Returns
    ///
    /// `None` when neither source sets a limit.
    pub fn for_task(metadata: &TaskMetadata, default_secs: Option<u64>) -> Option<Self> {
        metadata
            .timeout()
            .map(Self)
            .or_else(|| default_secs.filter(|s| *s > 0).map(Self::from_secs))
    }
}

/// Awaits `call`, failing with a timeout error once `limit` elapses.
pub async fn run_with_timeout<F>(
    limit: Option<TaskTimeout>,
    call: F,
) -> Result<String, ExecutionError>
where
    F: Future<Output = Result<String, ExecutionError>>,
{
    let Some(limit) = limit else {
        return call.await;
    };

    match tokio::time::timeout(limit.duration(), call).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::new(
            ExecutionErrorKind::Timeout,
            format!("exceeded timeout limit of {:?}", limit.duration()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::types::META_TIMEOUT_SECONDS;

    #[test]
    fn test_metadata_wins_over_default() {
        let meta = TaskMetadata::new().with(META_TIMEOUT_SECONDS, 2);
        assert_eq!(
            TaskTimeout::for_task(&meta, Some(60)),
            Some(TaskTimeout::from_secs(2))
        );
    }

    #[test]
    fn test_default_used_without_hint() {
        let meta = TaskMetadata::new();
        assert_eq!(
            TaskTimeout::for_task(&meta, Some(60)),
            Some(TaskTimeout::from_secs(60))
        );
        assert_eq!(TaskTimeout::for_task(&meta, None), None);
        assert_eq!(TaskTimeout::for_task(&meta, Some(0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let result = run_with_timeout(Some(TaskTimeout::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
        assert!(err.message.contains("1s"));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result = run_with_timeout(Some(TaskTimeout::from_secs(5)), async {
            Ok("done".to_string())
        })
        .await;
        assert_eq!(result.unwrap(), "done");

        let failed = run_with_timeout(None, async { Err(ExecutionError::failed("boom")) }).await;
        assert_eq!(failed.unwrap_err().kind, ExecutionErrorKind::Failed);
    }
}
