//! Compilation errors

use crate::template::TemplateError;
use thiserror::Error;

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(", did you mean '{}'?", s))
        .unwrap_or_default()
}

/// A workflow definition was rejected before any session could start
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid task name '{name}' in {parent}")]
    InvalidName { name: String, parent: String },

    #[error("duplicate task name '{name}' in {parent}")]
    DuplicateTask { name: String, parent: String },

    #[error("task {task}: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("task {task}: unknown operator '{operator}'{}", did_you_mean(.suggestion))]
    UnknownOperator {
        task: String,
        operator: String,
        suggestion: Option<String>,
    },

    #[error("task {task}: operator '{operator}' requires config key '{key}'")]
    MissingConfig {
        task: String,
        operator: String,
        key: String,
    },

    #[error("task {task}: undeclared variable '{variable}'{}", did_you_mean(.suggestion))]
    UndeclaredVariable {
        task: String,
        variable: String,
        suggestion: Option<String>,
    },

    #[error("task {task}: '{reference}' is not guaranteed to have succeeded before this task runs")]
    UnresolvableReference { task: String, reference: String },

    #[error("task {task}: invalid template in '{key}': {source}")]
    InvalidTemplate {
        task: String,
        key: String,
        #[source]
        source: TemplateError,
    },

    #[error("task {task}: invalid retry policy: {reason}")]
    InvalidRetry { task: String, reason: String },

    #[error("workflow {workflow}: invalid schedule: {reason}")]
    InvalidSchedule { workflow: String, reason: String },
}

impl CompileError {
    pub fn invalid_task(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task: task.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_retry(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRetry {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Full name of the task the error points at, when there is one
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::InvalidName { .. }
            | Self::DuplicateTask { .. }
            | Self::InvalidSchedule { .. } => None,
            Self::InvalidTask { task, .. }
            | Self::UnknownOperator { task, .. }
            | Self::MissingConfig { task, .. }
            | Self::UndeclaredVariable { task, .. }
            | Self::UnresolvableReference { task, .. }
            | Self::InvalidTemplate { task, .. }
            | Self::InvalidRetry { task, .. } => Some(task),
        }
    }
}
