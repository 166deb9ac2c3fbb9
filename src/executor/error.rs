//! Executor error types

use crate::session::{SessionId, TransitionError};
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// An active or conflicting attempt already owns the slot
    #[error("session conflict for {key}: {reason}")]
    SessionConflict { key: String, reason: String },

    /// Completion for a lock no current attempt holds
    #[error("no task holds lock '{lock_id}'")]
    TaskNotFound { lock_id: String },

    #[error("session {id} not found")]
    SessionNotFound { id: SessionId },

    /// The stored task state moved under us; the session was reloaded
    #[error("session {session_id} task {index} was changed by another writer")]
    StaleState { session_id: SessionId, index: usize },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutorError {
    pub fn conflict(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::SessionConflict {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Stale and duplicate callbacks are expected and only logged
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. })
    }
}
