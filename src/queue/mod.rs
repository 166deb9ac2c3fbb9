//! Task queue dispatchers
//!
//! The executor hands ready tasks to a [`TaskQueueDispatcher`]. The lock id
//! on each request is the deduplication key: a backend must refuse a lock id
//! that is already enqueued or in flight.

mod error;
mod http;
mod memory;
mod noop;
mod timeout;

pub use error::QueueError;
pub use http::HttpQueue;
pub use memory::InProcessQueue;
pub use noop::NoopDispatcher;
pub use timeout::TimeoutDispatcher;

use crate::config::{ConfigMap, QueueBackend, QueueConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A task handed to the agent population of one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub site_id: String,
    pub lock_id: String,
    pub session_id: String,
    pub task_index: usize,
    /// Full name of the task node
    pub task_name: String,
    pub operator: String,
    /// Rendered config
    pub config: ConfigMap,
    /// Attempt number of this task, starting at 1
    pub attempt: u32,
}

/// Queue boundary between the executor and agents
#[async_trait]
pub trait TaskQueueDispatcher: Send + Sync {
    /// Enqueue a task; `ResourceConflict` if its lock id is taken
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError>;

    /// Release a lock once an agent took or completed the task
    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError>;

    /// The executor stopped tracking a session; its released lock ids may
    /// be forgotten since none of them will be dispatched again
    fn session_closed(&self, _session_id: &str) {}

    /// Backend name for logging
    fn name(&self) -> &str;
}

#[async_trait]
impl TaskQueueDispatcher for Box<dyn TaskQueueDispatcher> {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        (**self).dispatch(request).await
    }

    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError> {
        (**self).task_finished(site_id, lock_id, agent_id).await
    }

    fn session_closed(&self, session_id: &str) {
        (**self).session_closed(session_id)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: TaskQueueDispatcher + ?Sized> TaskQueueDispatcher for Arc<T> {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        (**self).dispatch(request).await
    }

    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError> {
        (**self).task_finished(site_id, lock_id, agent_id).await
    }

    fn session_closed(&self, session_id: &str) {
        (**self).session_closed(session_id)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Build the configured backend
///
/// Every backend except `noop` is wrapped in a [`TimeoutDispatcher`] using
/// `dispatch_timeout`.
pub fn create_dispatcher(
    config: &QueueConfig,
    dispatch_timeout: std::time::Duration,
) -> Result<Arc<dyn TaskQueueDispatcher>, QueueError> {
    let dispatcher: Arc<dyn TaskQueueDispatcher> = match config.backend {
        QueueBackend::Noop => Arc::new(NoopDispatcher::new()),
        QueueBackend::Memory => Arc::new(TimeoutDispatcher::new(
            InProcessQueue::new(),
            dispatch_timeout,
        )),
        QueueBackend::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| QueueError::config("queue.url is required for the http backend"))?;
            let queue = HttpQueue::new(url, config.timeout())?;
            Arc::new(TimeoutDispatcher::new(queue, dispatch_timeout))
        }
    };
    Ok(dispatcher)
}
