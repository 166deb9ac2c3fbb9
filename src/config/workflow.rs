//! Workflow and task definitions

use super::value::ConfigMap;
use crate::trigger::RecurrenceRule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_site() -> String {
    "default".into()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    60_000
}

/// Retry policy for a task
///
/// `max_attempts` counts every attempt including the first, so `1` means
/// no retries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for the backoff delay, in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Add up to 25% random jitter to each delay
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have completed
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.interval_ms as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_interval_ms as f64);

        let final_delay = if self.jitter {
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// A single task or task group in a workflow tree
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    /// Task name (unique among its siblings)
    pub name: String,

    /// Operator that executes this task; absent for groups
    pub operator: Option<String>,

    /// Operator configuration, may contain templates
    #[serde(default)]
    pub config: ConfigMap,

    /// Run children concurrently instead of in declared order
    #[serde(default)]
    pub parallel: bool,

    /// Child tasks (groups only)
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,

    /// Branch that runs when this group fails
    pub on_error: Option<Box<TaskDefinition>>,

    /// Retry policy; inherited by descendants unless they override it
    pub retry: Option<RetryPolicy>,

    /// Queue site override
    pub site: Option<String>,
}

impl TaskDefinition {
    /// Operator task builder, handy in tests
    pub fn task(name: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: Some(operator.into()),
            ..Default::default()
        }
    }

    /// Group builder, handy in tests
    pub fn group(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            tasks,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_on_error(mut self, handler: TaskDefinition) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn is_group(&self) -> bool {
        self.operator.is_none()
    }
}

/// Full workflow definition, one per workflow revision
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Revision identifier; file loaders fill it in when absent
    pub revision: Option<String>,

    /// Default queue site for dispatch
    #[serde(default = "default_site")]
    pub site: String,

    /// Declared variables, visible to templates as `vars.<name>`
    #[serde(default)]
    pub variables: ConfigMap,

    /// Default retry policy for every task
    pub retry: Option<RetryPolicy>,

    /// Run top-level tasks concurrently
    #[serde(default)]
    pub parallel: bool,

    /// Top-level tasks in declared order
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,

    /// Workflow-level on-error branch
    pub on_error: Option<Box<TaskDefinition>>,

    /// Recurrence picked up by `flowd serve`
    pub schedule: Option<RecurrenceRule>,
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            revision: None,
            site: default_site(),
            variables: ConfigMap::new(),
            retry: None,
            parallel: false,
            tasks: Vec::new(),
            on_error: None,
            schedule: None,
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            tasks,
            ..Default::default()
        }
    }

    pub fn with_on_error(mut self, handler: TaskDefinition) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Root of the task tree, viewing the workflow itself as a group
    pub fn root(&self) -> TaskDefinition {
        TaskDefinition {
            name: self.name.clone(),
            operator: None,
            config: ConfigMap::new(),
            parallel: self.parallel,
            tasks: self.tasks.clone(),
            on_error: self.on_error.clone(),
            retry: self.retry.clone(),
            site: Some(self.site.clone()),
        }
    }
}
