//! Session scheduling and execution
//!
//! [`WorkflowExecutor`] starts sessions, dispatches ready tasks through a
//! [`TaskQueueDispatcher`](crate::queue::TaskQueueDispatcher), applies
//! completion callbacks and finalizes sessions exactly once.

mod engine;
mod error;
mod events;

pub use engine::{AdvanceReport, WorkflowExecutor};
pub use error::ExecutorError;
pub use events::{SessionEvent, TaskCompletion, TaskOutcome};
