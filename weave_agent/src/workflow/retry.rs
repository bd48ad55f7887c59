//! Retry, fallback and adaptive dispatch decisions.
//!
//! [`RetryPolicy`] is a pure decision function over a task and the kind of
//! error it produced. [`AdaptiveController`] watches recent outcomes and
//! tells the scheduler whether to dispatch ready tasks concurrently or one
//! at a time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weave_core::types::{Task, DEFAULT_CAPABILITY};

use crate::workflow::executor::{ExecutionError, ExecutionErrorKind};

fn default_budgets() -> BTreeMap<u8, u32> {
    BTreeMap::from([(1, 3), (2, 2)])
}

fn default_retries() -> u32 {
    1
}

fn default_fallbacks() -> HashMap<String, String> {
    ["browser", "data-analysis", "mcp"]
        .into_iter()
        .map(|cap| (cap.to_string(), DEFAULT_CAPABILITY.to_string()))
        .collect()
}

/// Tunable retry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed per priority
    #[serde(default = "default_budgets")]
    pub budgets: BTreeMap<u8, u32>,
    /// Retries for priorities missing from `budgets`
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    /// Capability tried once after the retry budget is spent
    #[serde(default = "default_fallbacks")]
    pub fallbacks: HashMap<String, String>,
    /// Delay between attempts in milliseconds
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budgets: default_budgets(),
            default_retries: default_retries(),
            fallbacks: default_fallbacks(),
            backoff_ms: 0,
        }
    }
}

/// Decides what happens after a failed attempt.
///
/// # Example
///
/// ```ignore
/// let policy = RetryPolicy::default();
/// if policy.should_retry(&task, &error) {
///     task.retry_count += 1;
///     // dispatch again
/// } else if let Some(cap) = policy.fallback_capability(&task) {
///     // one attempt with `cap`
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from config.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Underlying configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry budget for `task`.
    ///
    /// The `max_retries` metadata hint wins over the per-priority table.
    pub fn budget(&self, task: &Task) -> u32 {
        task.metadata.max_retries().unwrap_or_else(|| {
            self.config
                .budgets
                .get(&task.priority)
                .copied()
                .unwrap_or(self.config.default_retries)
        })
    }

    /// Returns true if `task` should be attempted again with its own capability.
    ///
    /// Unavailable executors are not retried since another call cannot succeed.
    pub fn should_retry(&self, task: &Task, error: &ExecutionError) -> bool {
        error.kind != ExecutionErrorKind::Unavailable && task.retry_count < self.budget(task)
    }

    /// Capability for the single fallback attempt, if any.
    pub fn fallback_capability(&self, task: &Task) -> Option<&str> {
        self.config
            .fallbacks
            .get(&task.capability)
            .map(String::as_str)
            .filter(|fallback| *fallback != task.capability)
    }

    /// Delay before the next attempt.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.backoff_ms)
    }
}

/// How the scheduler dispatches a ready set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// All ready tasks at once, bounded by `max_in_flight`
    Concurrent,
    /// One task at a time
    Serial,
}

/// Rolling success ratio that switches dispatch mode.
#[derive(Clone, Debug)]
pub struct AdaptiveController {
    window: usize,
    serial_below: f64,
    concurrent_above: f64,
    outcomes: VecDeque<bool>,
    mode: DispatchMode,
}

impl AdaptiveController {
    /// Creates a controller starting in concurrent mode.
    ///
    /// # Arguments
    ///
    /// * `window` - Number of recent outcomes considered
    /// * `serial_below` - Switch to serial when the success rate drops below this
    /// * `concurrent_above` - Switch back when the success rate rises above this
    pub fn new(window: usize, serial_below: f64, concurrent_above: f64) -> Self {
        Self {
            window: window.max(1),
            serial_below,
            concurrent_above,
            outcomes: VecDeque::new(),
            mode: DispatchMode::Concurrent,
        }
    }

    /// Current dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Records one attempt outcome and re-evaluates the mode.
    pub fn record(&mut self, success: bool) -> DispatchMode {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
        let rate = self.success_rate();
        self.adjust_strategy(rate)
    }

    /// Fraction of successful outcomes in the window; 1.0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|o| **o).count();
        ok as f64 / self.outcomes.len() as f64
    }

    /// Applies the thresholds to `success_rate`.
    pub fn adjust_strategy(&mut self, success_rate: f64) -> DispatchMode {
        let next = match self.mode {
            DispatchMode::Concurrent if success_rate < self.serial_below => DispatchMode::Serial,
            DispatchMode::Serial if success_rate > self.concurrent_above => DispatchMode::Concurrent,
            current => current,
        };
        if next != self.mode {
            tracing::info!(
                from = ?self.mode,
                to = ?next,
                success_rate,
                "switching dispatch mode"
            );
            self.mode = next;
        }
        self.mode
    }
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new(20, 0.7, 0.9)
    }
}
