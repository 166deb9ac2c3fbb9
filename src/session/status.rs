//! Task and session status values and their legal transitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status of one task node within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting on preceding siblings or the parent
    Blocked,
    /// Eligible for dispatch
    Ready,
    /// Dispatched to an agent, or a group with children in progress
    Running,
    Success,
    /// Attempt failed; resolved immediately to one of the next three
    Error,
    /// Waiting out the retry backoff
    RetryWaiting,
    /// Failed permanently, routed to an on-error branch
    ErrorHandled,
    /// Failed permanently with nothing to catch it
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        Self::Blocked,
        Self::Ready,
        Self::Running,
        Self::Success,
        Self::Error,
        Self::RetryWaiting,
        Self::ErrorHandled,
        Self::Failed,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::ErrorHandled | Self::Failed)
    }

    /// Started but not yet settled; a group waits while any child is here
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Running | Self::RetryWaiting | Self::Error
        )
    }

    /// Whether the state machine permits `self -> next`
    ///
    /// `Running -> Failed | ErrorHandled` is only taken by groups, which
    /// settle from their children instead of from an agent.
    #[must_use]
    pub const fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Blocked, Ready)
                | (Ready, Running)
                | (Ready, Error)
                | (Running, Success)
                | (Running, Error)
                | (Running, Failed)
                | (Running, ErrorHandled)
                | (Error, RetryWaiting)
                | (Error, ErrorHandled)
                | (Error, Failed)
                | (RetryWaiting, Ready)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::RetryWaiting => "RETRY_WAITING",
            Self::ErrorHandled => "ERROR_HANDLED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// Outcome of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Success,
    /// Failed somewhere, but every failure was caught by an on-error branch
    ErrorHandled,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        Self::Running,
        Self::Success,
        Self::ErrorHandled,
        Self::Failed,
        Self::Cancelled,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Session outcome implied by a settled root status
    pub const fn from_root(root: TaskStatus) -> Option<Self> {
        match root {
            TaskStatus::Success => Some(Self::Success),
            TaskStatus::ErrorHandled => Some(Self::ErrorHandled),
            TaskStatus::Failed => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::ErrorHandled => "ERROR_HANDLED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown session status '{}'", s))
    }
}

/// An illegal state change was requested
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task {index}: cannot move from {from} to {to}")]
    Illegal {
        index: usize,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {index} does not exist")]
    UnknownTask { index: usize },

    #[error("session is already {status}")]
    SessionTerminal { status: SessionStatus },
}
