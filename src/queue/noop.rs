//! Dispatcher that accepts everything and delivers nothing

use super::{DispatchRequest, QueueError, TaskQueueDispatcher};
use async_trait::async_trait;
use tracing::debug;

/// Null dispatcher for exercising executor bookkeeping without a queue
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

impl NoopDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskQueueDispatcher for NoopDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        debug!(lock_id = %request.lock_id, site = %request.site_id, "noop dispatch");
        Ok(())
    }

    async fn task_finished(
        &self,
        _site_id: &str,
        _lock_id: &str,
        _agent_id: &str,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
