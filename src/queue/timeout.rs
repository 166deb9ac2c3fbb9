//! Bounded dispatch wrapper

use super::{DispatchRequest, QueueError, TaskQueueDispatcher};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Wrapper that bounds every call on the inner dispatcher
///
/// A timed-out dispatch surfaces as [`QueueError::Timeout`], which the
/// executor treats like a lock conflict and retries on a later tick.
pub struct TimeoutDispatcher<T: TaskQueueDispatcher> {
    inner: Arc<T>,
    timeout: Duration,
}

impl<T: TaskQueueDispatcher> TimeoutDispatcher<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self::from_arc(Arc::new(inner), timeout)
    }

    /// Wrap a dispatcher that is also used elsewhere, e.g. a queue polled by agents
    pub fn from_arc(inner: Arc<T>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }
}

#[async_trait]
impl<T: TaskQueueDispatcher + 'static> TaskQueueDispatcher for TimeoutDispatcher<T> {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        match tokio::time::timeout(self.timeout, self.inner.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(lock_id = %request.lock_id, timeout = ?self.timeout, "dispatch timed out");
                Err(QueueError::Timeout {
                    elapsed: self.timeout,
                })
            }
        }
    }

    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError> {
        tokio::time::timeout(
            self.timeout,
            self.inner.task_finished(site_id, lock_id, agent_id),
        )
        .await
        .unwrap_or(Err(QueueError::Timeout {
            elapsed: self.timeout,
        }))
    }

    fn session_closed(&self, session_id: &str) {
        self.inner.session_closed(session_id)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
