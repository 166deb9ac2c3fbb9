//! Session and task state records

use super::status::{SessionStatus, TaskStatus};
use crate::compiler::CompiledTaskGraph;
use crate::config::ConfigMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical schedule slot: at most one active session per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub project: String,
    pub workflow: String,
    pub session_time: DateTime<Utc>,
}

impl SessionKey {
    pub fn new(
        project: impl Into<String>,
        workflow: impl Into<String>,
        session_time: DateTime<Utc>,
    ) -> Self {
        Self {
            project: project.into(),
            workflow: workflow.into(),
            session_time,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.project,
            self.workflow,
            self.session_time.to_rfc3339()
        )
    }
}

/// Per-node execution state, owned by exactly one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub index: usize,
    pub status: TaskStatus,
    /// Completed attempts
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Output recorded on success, readable by downstream templates
    pub output: Option<ConfigMap>,
    /// Lock id of the in-flight attempt
    pub lock_id: Option<String>,
    /// Lock id of a READY task's dispatch that timed out or conflicted; the
    /// queue may still have accepted it, so its completion is honored
    #[serde(default)]
    pub pending_lock: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: TaskStatus::Blocked,
            attempts: 0,
            last_error: None,
            output: None,
            lock_id: None,
            pending_lock: None,
            retry_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// How `start_session` treats earlier attempts for the same slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptMode {
    /// First attempt; any existing attempt is a conflict
    #[default]
    Fresh,
    /// Re-run only what did not succeed in the latest attempt
    RetryFailed,
    /// Re-run everything as a new attempt
    RetryAll,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptOptions {
    pub mode: AttemptMode,
    /// Overrides for declared variables
    pub params: ConfigMap,
}

impl AttemptOptions {
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn retry_failed() -> Self {
        Self {
            mode: AttemptMode::RetryFailed,
            ..Default::default()
        }
    }

    pub fn retry_all() -> Self {
        Self {
            mode: AttemptMode::RetryAll,
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: ConfigMap) -> Self {
        self.params = params;
        self
    }
}

/// One execution attempt of a compiled graph
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    /// Attempt number for the slot, starting at 1
    pub attempt: u32,
    pub graph: Arc<CompiledTaskGraph>,
    /// One entry per graph node, same indices
    pub tasks: Vec<TaskState>,
    pub status: SessionStatus,
    pub params: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    /// New session with every node BLOCKED except the root
    pub fn new(
        key: SessionKey,
        graph: Arc<CompiledTaskGraph>,
        attempt: u32,
        params: ConfigMap,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tasks: Vec<TaskState> = (0..graph.len()).map(TaskState::new).collect();
        if let Some(root) = tasks.first_mut() {
            root.status = TaskStatus::Ready;
        }
        Self {
            id: SessionId::new(),
            key,
            attempt,
            graph,
            tasks,
            status: SessionStatus::Running,
            params,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn task(&self, index: usize) -> Option<&TaskState> {
        self.tasks.get(index)
    }

    pub fn status_of(&self, index: usize) -> Option<TaskStatus> {
        self.tasks.get(index).map(|t| t.status)
    }

    /// Status of the node with the given full name
    pub fn status_by_name(&self, full_name: &str) -> Option<TaskStatus> {
        self.graph
            .find(full_name)
            .and_then(|n| self.status_of(n.index))
    }

    /// Node holding the given lock id, if the attempt is still current
    pub fn task_by_lock(&self, lock_id: &str) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.lock_id.as_deref() == Some(lock_id))
    }

    /// READY node whose unconfirmed dispatch used the given lock id
    pub fn task_by_pending_lock(&self, lock_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| {
            t.status == TaskStatus::Ready && t.pending_lock.as_deref() == Some(lock_id)
        })
    }

    /// Lock id for the next attempt of `index`
    pub fn next_lock_id(&self, index: usize) -> String {
        let attempt = self.tasks.get(index).map(|t| t.attempts).unwrap_or(0) + 1;
        format!("{}:{}:{}", self.id, index, attempt)
    }

    /// Count of tasks per status, in `TaskStatus::ALL` order, omitting zeros
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        TaskStatus::ALL
            .into_iter()
            .map(|s| (s, self.tasks.iter().filter(|t| t.status == s).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
