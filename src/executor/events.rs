//! Messages into and out of the executor

use crate::config::ConfigMap;
use crate::session::{SessionId, SessionStatus, TaskStatus};
use serde::{Deserialize, Serialize};

/// What an agent reported for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { output: ConfigMap },
    Failure { error: String },
}

impl TaskOutcome {
    pub fn success(output: ConfigMap) -> Self {
        Self::Success { output }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }
}

/// Completion callback delivered by the agent-facing layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub lock_id: String,
    pub agent_id: String,
    pub outcome: TaskOutcome,
}

/// Progress notifications for observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    SessionStarted {
        session_id: SessionId,
        workflow: String,
        attempt: u32,
        tasks: usize,
    },
    TaskDispatched {
        session_id: SessionId,
        task: String,
        lock_id: String,
        attempt: u32,
    },
    TaskFinished {
        session_id: SessionId,
        task: String,
        status: TaskStatus,
        error: Option<String>,
    },
    SessionFinished {
        session_id: SessionId,
        status: SessionStatus,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::TaskDispatched { session_id, .. }
            | Self::TaskFinished { session_id, .. }
            | Self::SessionFinished { session_id, .. } => session_id,
        }
    }
}
