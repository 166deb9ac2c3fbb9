//! In-process queue for local agents and tests

use super::{DispatchRequest, QueueError, TaskQueueDispatcher};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct Claim {
    agent_id: String,
    session_id: String,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Per-site FIFO of requests no agent has taken yet; empty sites are dropped
    pending: HashMap<String, VecDeque<DispatchRequest>>,
    /// Lock id -> session, for requests still in `pending`
    enqueued: HashMap<String, String>,
    in_flight: HashMap<String, Claim>,
    /// Released lock id -> session; never accepted again while the session is open
    released: HashMap<String, String>,
}

impl QueueState {
    fn is_taken(&self, lock_id: &str) -> bool {
        self.enqueued.contains_key(lock_id)
            || self.in_flight.contains_key(lock_id)
            || self.released.contains_key(lock_id)
    }

    fn remove_pending(&mut self, site_id: &str, lock_id: &str) {
        if let Some(queue) = self.pending.get_mut(site_id) {
            queue.retain(|r| r.lock_id != lock_id);
            if queue.is_empty() {
                self.pending.remove(site_id);
            }
        }
    }
}

/// Per-site FIFO queue shared between the executor and in-process agents
///
/// A lock id is accepted once. It stays taken while enqueued or in flight
/// and is retired by `task_finished`. Retired ids are kept until the
/// executor reports the owning session closed, so memory is bounded by the
/// sessions still open.
#[derive(Debug, Default)]
pub struct InProcessQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the oldest pending task for `site_id`, marking it in flight
    pub fn poll(&self, site_id: &str, agent_id: &str) -> Option<DispatchRequest> {
        let mut state = self.state();
        let queue = state.pending.get_mut(site_id)?;
        let request = queue.pop_front()?;
        if queue.is_empty() {
            state.pending.remove(site_id);
        }
        state.enqueued.remove(&request.lock_id);
        state.in_flight.insert(
            request.lock_id.clone(),
            Claim {
                agent_id: agent_id.to_string(),
                session_id: request.session_id.clone(),
            },
        );
        debug!(lock_id = %request.lock_id, agent = agent_id, "task taken");
        Some(request)
    }

    /// Like [`poll`](Self::poll), waiting up to `wait` for a task to arrive
    pub async fn poll_wait(
        &self,
        site_id: &str,
        agent_id: &str,
        wait: Duration,
    ) -> Option<DispatchRequest> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register before checking so a dispatch in between still wakes us
            let notified = self.notify.notified();
            if let Some(request) = self.poll(site_id, agent_id) {
                return Some(request);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Tasks waiting for an agent on `site_id`
    pub fn pending(&self, site_id: &str) -> usize {
        self.state().pending.get(site_id).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Agent currently holding `lock_id`
    pub fn holder(&self, lock_id: &str) -> Option<String> {
        self.state()
            .in_flight
            .get(lock_id)
            .map(|claim| claim.agent_id.clone())
    }

    /// Retired lock ids still remembered
    pub fn released(&self) -> usize {
        self.state().released.len()
    }

    /// Sites with tasks waiting
    pub fn sites(&self) -> usize {
        self.state().pending.len()
    }
}

#[async_trait]
impl TaskQueueDispatcher for InProcessQueue {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            let lock = &request.lock_id;
            if state.is_taken(lock) {
                return Err(QueueError::conflict(lock.clone()));
            }
            state
                .enqueued
                .insert(lock.clone(), request.session_id.clone());
            state
                .pending
                .entry(request.site_id.clone())
                .or_default()
                .push_back(request.clone());
        }
        debug!(lock_id = %request.lock_id, site = %request.site_id, "task enqueued");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn task_finished(
        &self,
        site_id: &str,
        lock_id: &str,
        agent_id: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.released.contains_key(lock_id) {
            return Ok(());
        }
        let session_id = match state.in_flight.remove(lock_id) {
            Some(claim) => claim.session_id,
            None => {
                let session_id =
                    state
                        .enqueued
                        .remove(lock_id)
                        .ok_or_else(|| QueueError::UnknownLock {
                            lock_id: lock_id.to_string(),
                        })?;
                state.remove_pending(site_id, lock_id);
                session_id
            }
        };
        state.released.insert(lock_id.to_string(), session_id);
        debug!(lock_id, agent = agent_id, "lock released");
        Ok(())
    }

    fn session_closed(&self, session_id: &str) {
        self.state().released.retain(|_, owner| owner != session_id);
    }

    fn name(&self) -> &str {
        "memory"
    }
}
