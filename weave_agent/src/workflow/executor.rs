//! Executor contract and built-in executors.
//!
//! An [`Executor`] performs the work behind one capability label. The engine
//! never inspects executor internals; it hands over an instruction string and
//! receives either a result string or an [`ExecutionError`] whose
//! [`kind`](ExecutionError::kind) drives the retry decision.
//!
//! The built-in set is closed:
//! - [`FnExecutor`]: wraps an async closure
//! - [`EchoExecutor`]: returns the instruction unchanged
//! - [`CommandExecutor`]: runs an external program with the instruction on stdin

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Category of an executor failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionErrorKind {
    /// The executor ran and reported failure
    Failed,
    /// The call exceeded its time limit
    Timeout,
    /// The executor could not be reached or constructed
    Unavailable,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionErrorKind::Failed => "failed",
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Failure of a single executor call.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    /// Failure category
    pub kind: ExecutionErrorKind,
    /// Human-readable detail, stored on the task when it fails for good
    pub message: String,
}

impl ExecutionError {
    /// Creates an error of the given kind.
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The executor ran and failed.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Failed, message)
    }

    /// The call timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Timeout, message)
    }

    /// The executor is not available.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Unavailable, message)
    }
}

/// Whether an executor tolerates concurrent `execute` calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorConcurrency {
    /// Calls may overlap
    #[default]
    Shared,
    /// The registry serializes calls for this executor
    Serialized,
}

/// Performs the work for one capability.
///
/// Instances are cached by the registry and shared by every workflow in the
/// process, so implementations must be `Send + Sync`. An executor that cannot
/// handle overlapping calls reports [`ExecutorConcurrency::Serialized`] and
/// the registry guards it with a mutex.
///
/// # Example
///
/// ```ignore
/// struct Upper;
///
/// #[async_trait]
/// impl Executor for Upper {
///     fn name(&self) -> &str { "upper" }
///
///     async fn execute(&self, instruction: &str) -> Result<String, ExecutionError> {
///         Ok(instruction.to_uppercase())
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one instruction.
    ///
    /// # Arguments
    ///
    /// * `instruction` - Task description, prefixed with dependency results
    ///
    /// # Returns
    ///
    /// - `Ok(String)` - The task result
    /// - `Err(ExecutionError)` - The call failed
    async fn execute(&self, instruction: &str) -> Result<String, ExecutionError>;

    /// Concurrency contract of this executor.
    fn concurrency(&self) -> ExecutorConcurrency {
        ExecutorConcurrency::Shared
    }
}

type BoxedCall =
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, ExecutionError>> + Send>>
        + Send
        + Sync;

/// Executor backed by an async closure.
///
/// # Example
///
/// ```ignore
/// let exec = FnExecutor::new("upper", |instruction| async move {
///     Ok(instruction.to_uppercase())
/// });
/// ```
#[derive(Clone)]
pub struct FnExecutor {
    name: String,
    call: Arc<BoxedCall>,
    concurrency: ExecutorConcurrency,
}

impl FnExecutor {
    /// Wraps `f` as an executor.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ExecutionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            call: Arc::new(move |instruction| Box::pin(f(instruction))),
            concurrency: ExecutorConcurrency::Shared,
        }
    }

    /// Marks this executor as requiring serialized calls.
    pub fn serialized(mut self) -> Self {
        self.concurrency = ExecutorConcurrency::Serialized;
        self
    }
}

impl fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[async_trait]
impl Executor for FnExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, instruction: &str) -> Result<String, ExecutionError> {
        (self.call)(instruction.to_string()).await
    }

    fn concurrency(&self) -> ExecutorConcurrency {
        self.concurrency
    }
}

/// Returns the instruction unchanged.
///
/// Used as the default `general` executor so a plan can be dry-run end to end.
#[derive(Clone, Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, instruction: &str) -> Result<String, ExecutionError> {
        Ok(instruction.to_string())
    }
}

/// Runs an external program per call.
///
/// The instruction is written to the child's stdin and its stdout becomes
/// the result. A non-zero exit is a `Failed` error carrying stderr; a spawn
/// failure is `Unavailable`.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandExecutor {
    /// Path to the executable
    pub program: PathBuf,
    /// Arguments passed to every invocation
    pub args: Vec<String>,
    /// Concurrency contract
    pub concurrency: ExecutorConcurrency,
}

impl CommandExecutor {
    /// Creates an executor for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            concurrency: ExecutorConcurrency::Shared,
        }
    }

    /// Sets the arguments passed to every invocation.
    ///
    /// # Returns
    ///
    /// Self for builder pattern chaining
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Marks the program as unsafe to run concurrently.
    pub fn serialized(mut self, serialized: bool) -> Self {
        self.concurrency = if serialized {
            ExecutorConcurrency::Serialized
        } else {
            ExecutorConcurrency::Shared
        };
        self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        self.program.to_str().unwrap_or("command")
    }

    async fn execute(&self, instruction: &str) -> Result<String, ExecutionError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Timed-out calls drop the future; take the child down with it
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ExecutionError::unavailable(format!(
                "failed to spawn {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin is not an error here
            if let Err(e) = stdin.write_all(instruction.as_bytes()).await {
                tracing::debug!(program = %self.program.display(), error = %e, "stdin closed early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutionError::failed(format!("failed to wait for child: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), output.status)
            } else {
                stderr
            };
            Err(ExecutionError::failed(message))
        }
    }

    fn concurrency(&self) -> ExecutorConcurrency {
        self.concurrency
    }
}

/// Config-driven executor construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutorKind {
    /// [`EchoExecutor`]
    Echo,
    /// [`CommandExecutor`]
    Command {
        /// Program to run
        program: PathBuf,
        /// Arguments passed to every invocation
        #[serde(default)]
        args: Vec<String>,
        /// Serialize calls to this program
        #[serde(default)]
        serialized: bool,
    },
}

impl ExecutorKind {
    /// Builds a fresh executor instance.
    pub fn build(&self) -> Arc<dyn Executor> {
        match self {
            ExecutorKind::Echo => Arc::new(EchoExecutor),
            ExecutorKind::Command {
                program,
                args,
                serialized,
            } => Arc::new(
                CommandExecutor::new(program.clone())
                    .args(args.clone())
                    .serialized(*serialized),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_executor() {
        let exec = EchoExecutor;
        assert_eq!(exec.execute("hello").await.unwrap(), "hello");
        assert_eq!(exec.concurrency(), ExecutorConcurrency::Shared);
    }

    #[tokio::test]
    async fn test_fn_executor() {
        let exec = FnExecutor::new("upper", |s: String| async move { Ok(s.to_uppercase()) });
        assert_eq!(exec.name(), "upper");
        assert_eq!(exec.execute("abc").await.unwrap(), "ABC");
        assert_eq!(exec.serialized().concurrency(), ExecutorConcurrency::Serialized);
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::timeout("took too long");
        assert_eq!(err.to_string(), "timeout: took too long");
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
    }

    #[test]
    fn test_executor_kind_from_yaml() {
        let kind: ExecutorKind =
            serde_yaml::from_str("kind: command\nprogram: /bin/cat\nserialized: true\n").unwrap();
        assert_eq!(
            kind,
            ExecutorKind::Command {
                program: PathBuf::from("/bin/cat"),
                args: vec![],
                serialized: true,
            }
        );
        let echo: ExecutorKind = serde_yaml::from_str("kind: echo").unwrap();
        assert_eq!(echo, ExecutorKind::Echo);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_stdin_to_stdout() {
        let exec = CommandExecutor::new("cat");
        assert_eq!(exec.execute("piped through").await.unwrap(), "piped through");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_nonzero_exit() {
        let exec = CommandExecutor::new("sh").args(vec![
            "-c".to_string(),
            "echo broken >&2; exit 3".to_string(),
        ]);
        let err = exec.execute("").await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Failed);
        assert_eq!(err.message, "broken");
    }

    #[tokio::test]
    async fn test_command_executor_missing_program() {
        let exec = CommandExecutor::new("/definitely/not/a/real/program");
        let err = exec.execute("x").await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Unavailable);
    }
}
