//! Queue error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by task queue dispatchers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    /// Lock id already enqueued, in flight, or used by an earlier attempt
    #[error("lock '{lock_id}' is already enqueued or in flight")]
    ResourceConflict { lock_id: String },

    /// Dispatch did not complete within the bound
    #[error("dispatch timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// `task_finished` for a lock the queue never saw
    #[error("unknown lock '{lock_id}'")]
    UnknownLock { lock_id: String },

    /// Queue service unreachable or failing
    #[error("queue unavailable: {message}")]
    Unavailable { message: String },

    /// Queue refused the request
    #[error("dispatch rejected: {message}")]
    Rejected { message: String },

    #[error("invalid queue configuration: {message}")]
    Config { message: String },
}

impl QueueError {
    /// Conflicts and timeouts are retried on a later tick, never counted as
    /// task failures
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::ResourceConflict { .. } | QueueError::Timeout { .. }
        )
    }

    pub fn conflict(lock_id: impl Into<String>) -> Self {
        Self::ResourceConflict {
            lock_id: lock_id.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(QueueError::conflict("l").is_transient());
        assert!(QueueError::Timeout {
            elapsed: Duration::from_secs(1)
        }
        .is_transient());

        assert!(!QueueError::unavailable("down").is_transient());
        assert!(!QueueError::rejected("bad").is_transient());
        assert!(!QueueError::UnknownLock { lock_id: "l".into() }.is_transient());
    }

    #[test]
    fn test_display() {
        let err = QueueError::conflict("s:1:1");
        assert!(err.to_string().contains("s:1:1"));
    }
}
