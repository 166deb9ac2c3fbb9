//! Workflow executor
//!
//! The executor is the only writer of sessions. Each active session sits
//! behind its own async mutex, so advancement steps and completion callbacks
//! for one session apply one at a time while different sessions progress
//! independently. Every task transition is written through the store's
//! compare-and-set before it counts.

use super::error::ExecutorError;
use super::events::{SessionEvent, TaskCompletion, TaskOutcome};
use crate::cli::CancellationToken;
use crate::compiler::CompiledTaskGraph;
use crate::config::ExecutorConfig;
use crate::queue::{DispatchRequest, TaskQueueDispatcher};
use crate::session::{
    AttemptMode, AttemptOptions, Session, SessionId, SessionKey, SessionStatus, TaskState,
    TaskStatus, TransitionError,
};
use crate::store::{SessionStore, StoreError};
use crate::template::TemplateEngine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, RwLock};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Result of one advancement step for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    pub dispatched: usize,
    /// Ready tasks left for a later tick after a lock conflict or timeout
    pub deferred: usize,
    /// Set on the step that finalized the session
    pub finished: Option<SessionStatus>,
}

enum Dispatch {
    Sent,
    Deferred,
    Failed,
}

pub struct WorkflowExecutor {
    store: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn TaskQueueDispatcher>,
    templates: TemplateEngine,
    config: ExecutorConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    /// Lock id -> owning session, for completion lookup
    locks: std::sync::Mutex<HashMap<String, SessionId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        dispatcher: Arc<dyn TaskQueueDispatcher>,
        config: ExecutorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            dispatcher,
            templates: TemplateEngine::new(),
            config,
            sessions: RwLock::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Receive progress events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, SessionId>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Register the running and pending lock ids of `session`
    fn index_locks(&self, session: &Session) {
        let mut locks = self.locks();
        for task in &session.tasks {
            for lock in [&task.lock_id, &task.pending_lock].into_iter().flatten() {
                locks.insert(lock.clone(), session.id.clone());
            }
        }
    }

    fn track(&self, session: Session) {
        let id = session.id.clone();
        self.index_locks(&session);
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Mutex::new(session)));
    }

    fn untrack(&self, id: &SessionId) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.locks().retain(|_, owner| owner != id);
        self.dispatcher.session_closed(id.as_str());
    }

    /// Sessions this executor is driving, including cancelled ones whose
    /// running tasks have not reported back yet
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of a session, active or stored
    pub async fn session(&self, id: &SessionId) -> Result<Option<Session>, ExecutorError> {
        if let Some(entry) = self.entry(id) {
            return Ok(Some(entry.lock().await.clone()));
        }
        Ok(self.store.load(id)?)
    }

    /// Create a new attempt for the slot `(project, graph.workflow, session_time)`
    ///
    /// A fresh start conflicts with any existing attempt. Retries need the
    /// latest attempt to be terminal; `RetryFailed` carries its successful
    /// tasks over and refuses to retry a successful attempt.
    pub async fn start_session(
        &self,
        project: &str,
        graph: Arc<CompiledTaskGraph>,
        session_time: DateTime<Utc>,
        options: AttemptOptions,
    ) -> Result<Session, ExecutorError> {
        let key = SessionKey::new(project, graph.workflow.clone(), session_time);
        let previous = self.store.latest_attempt(&key)?;

        let attempt = match (options.mode, &previous) {
            (_, None) => 1,
            (AttemptMode::Fresh, Some(p)) => {
                return Err(ExecutorError::conflict(
                    &key,
                    format!("attempt {} already exists ({})", p.attempt, p.status),
                ));
            }
            (_, Some(p)) if !p.is_terminal() => {
                return Err(ExecutorError::conflict(
                    &key,
                    format!("attempt {} is still running", p.attempt),
                ));
            }
            (AttemptMode::RetryFailed, Some(p)) if p.status == SessionStatus::Success => {
                return Err(ExecutorError::conflict(
                    &key,
                    format!("attempt {} already succeeded", p.attempt),
                ));
            }
            (_, Some(p)) => p.attempt + 1,
        };

        let mut session = Session::new(key.clone(), graph, attempt, options.params, Utc::now());
        if options.mode == AttemptMode::RetryFailed {
            if let Some(previous) = &previous {
                session.resume_from(previous);
            }
        }

        match self.store.persist(&session) {
            Err(StoreError::DuplicateSession { .. }) => {
                return Err(ExecutorError::conflict(
                    &key,
                    format!("attempt {} was started concurrently", attempt),
                ));
            }
            other => other?,
        }

        let id = session.id.clone();
        info!(session = %id, key = %key, attempt, "session started");
        self.emit(SessionEvent::SessionStarted {
            session_id: id.clone(),
            workflow: key.workflow.clone(),
            attempt,
            tasks: session.graph.operator_tasks().count(),
        });
        self.track(session);

        if let Err(e) = self.advance(&id).await {
            warn!(session = %id, error = %e, "initial advance failed");
        }
        self.session(&id)
            .await?
            .ok_or(ExecutorError::SessionNotFound { id })
    }

    /// One advancement step: promote, dispatch ready tasks, finalize
    ///
    /// Safe to call concurrently; calls for the same session serialize and a
    /// task already RUNNING is never dispatched again.
    pub async fn advance(&self, id: &SessionId) -> Result<AdvanceReport, ExecutorError> {
        let Some(entry) = self.entry(id) else {
            return Ok(AdvanceReport::default());
        };
        let mut session = entry.lock().await;
        self.refresh(&mut session)?;
        let result = self.advance_locked(&mut session).await;
        if let Err(ExecutorError::StaleState { .. }) = &result {
            self.reload(&mut session)?;
        }
        let done = session.is_terminal() && !has_running(&session);
        drop(session);
        if done {
            self.untrack(id);
        }
        result
    }

    async fn advance_locked(&self, session: &mut Session) -> Result<AdvanceReport, ExecutorError> {
        let mut report = AdvanceReport::default();
        if session.is_terminal() {
            return Ok(report);
        }

        loop {
            let before = session.tasks.clone();
            let ready = session.promote(Utc::now());
            self.commit(session, &before)?;

            // A failed dispatch may arm an error handler, so go round again
            let mut failed = false;
            for index in ready {
                match self.dispatch_task(session, index).await? {
                    Dispatch::Sent => report.dispatched += 1,
                    Dispatch::Deferred => report.deferred += 1,
                    Dispatch::Failed => failed = true,
                }
            }
            if !failed {
                break;
            }
        }

        let now = Utc::now();
        if let Some(status) = session.try_finalize(now) {
            if self.store.finish_session(&session.id, status, now)? {
                info!(session = %session.id, status = %status, "session finished");
                self.emit(SessionEvent::SessionFinished {
                    session_id: session.id.clone(),
                    status,
                });
                report.finished = Some(status);
            } else {
                // Finalized elsewhere
                self.reload(session)?;
            }
        }
        Ok(report)
    }

    async fn dispatch_task(
        &self,
        session: &mut Session,
        index: usize,
    ) -> Result<Dispatch, ExecutorError> {
        let graph = Arc::clone(&session.graph);
        let node = &graph.nodes[index];
        let lock_id = session.next_lock_id(index);
        let attempt = session.tasks[index].attempts + 1;

        let rendered = {
            let ctx = session.template_context(index);
            self.templates.render_config(&node.config, &ctx)
        };
        let config = match rendered {
            Ok(config) => config,
            Err(e) => {
                warn!(session = %session.id, task = %node.full_name, error = %e, "config rendering failed");
                self.fail_task(session, index, format!("config rendering failed: {}", e))?;
                return Ok(Dispatch::Failed);
            }
        };

        let request = DispatchRequest {
            site_id: node.site.clone(),
            lock_id: lock_id.clone(),
            session_id: session.id.to_string(),
            task_index: index,
            task_name: node.full_name.clone(),
            operator: node.operator.clone().unwrap_or_default(),
            config,
            attempt,
        };

        // Registered first so a fast agent's completion finds its session
        self.locks().insert(lock_id.clone(), session.id.clone());

        match self.dispatcher.dispatch(&request).await {
            Ok(()) => {
                let before = session.tasks[index].clone();
                session.mark_dispatched(index, lock_id.clone(), Utc::now())?;
                self.commit_task(session, &before)?;
                debug!(session = %session.id, task = %node.full_name, lock_id = %lock_id, "task dispatched");
                self.emit(SessionEvent::TaskDispatched {
                    session_id: session.id.clone(),
                    task: node.full_name.clone(),
                    lock_id,
                    attempt,
                });
                Ok(Dispatch::Sent)
            }
            Err(e) if e.is_transient() => {
                // The queue may already hold this lock, so keep it claimable
                if session.tasks[index].pending_lock.as_deref() != Some(lock_id.as_str()) {
                    let before = session.tasks[index].clone();
                    session.mark_pending(index, lock_id.clone());
                    self.commit_task(session, &before)?;
                }
                debug!(session = %session.id, task = %node.full_name, lock_id = %lock_id, error = %e, "dispatch deferred");
                Ok(Dispatch::Deferred)
            }
            Err(e) => {
                self.locks().remove(&lock_id);
                warn!(session = %session.id, task = %node.full_name, error = %e, "dispatch failed");
                self.fail_task(session, index, format!("dispatch failed: {}", e))?;
                Ok(Dispatch::Failed)
            }
        }
    }

    fn fail_task(
        &self,
        session: &mut Session,
        index: usize,
        error: String,
    ) -> Result<TaskStatus, ExecutorError> {
        let before = session.tasks[index].clone();
        let status = session.record_failure(index, error.clone(), Utc::now())?;
        self.commit_task(session, &before)?;
        self.emit(SessionEvent::TaskFinished {
            session_id: session.id.clone(),
            task: session.graph.nodes[index].full_name.clone(),
            status,
            error: Some(error),
        });
        Ok(status)
    }

    /// Apply an agent-reported outcome and release its lock
    ///
    /// A READY task whose dispatch timed out or conflicted under this lock id
    /// is taken as RUNNING first. Unknown or superseded lock ids fail with
    /// `TaskNotFound` and change nothing.
    pub async fn handle_completion(
        &self,
        completion: &TaskCompletion,
    ) -> Result<TaskStatus, ExecutorError> {
        let lock_id = completion.lock_id.as_str();
        let not_found = || ExecutorError::TaskNotFound {
            lock_id: lock_id.to_string(),
        };
        let session_id = self.locks().get(lock_id).cloned().ok_or_else(not_found)?;
        let entry = self.entry(&session_id).ok_or_else(not_found)?;

        let mut session = entry.lock().await;
        let index = session
            .task_by_lock(lock_id)
            .or_else(|| session.task_by_pending_lock(lock_id))
            .ok_or_else(not_found)?;
        let before = session.tasks[index].clone();
        let now = Utc::now();

        let (status, error) = match apply_outcome(&mut session, index, &completion.outcome, now) {
            Ok(applied) => applied,
            Err(e) => {
                session.tasks[index] = before;
                return Err(e.into());
            }
        };
        if before.lock_id.is_none() {
            debug!(session = %session_id, lock_id, "pending dispatch confirmed by completion");
        }
        if let Err(e) = self.commit_task(&session, &before) {
            self.reload(&mut session)?;
            return Err(e);
        }
        self.locks().remove(lock_id);

        let task = session.graph.nodes[index].full_name.clone();
        let site = session.graph.nodes[index].site.clone();
        info!(session = %session_id, task = %task, status = %status, agent = %completion.agent_id, "task finished");
        self.emit(SessionEvent::TaskFinished {
            session_id: session_id.clone(),
            task,
            status,
            error,
        });

        let cancelled = session.is_terminal();
        let drained = cancelled && !has_running(&session);
        drop(session);

        if let Err(e) = self
            .dispatcher
            .task_finished(&site, lock_id, &completion.agent_id)
            .await
        {
            warn!(lock_id, error = %e, "failed to release lock");
        }

        if drained {
            self.untrack(&session_id);
        } else if !cancelled {
            if let Err(e) = self.advance(&session_id).await {
                warn!(session = %session_id, error = %e, "advance after completion failed");
            }
        }
        Ok(status)
    }

    /// Stop dispatching for a session; running tasks may still report back
    pub async fn cancel_session(&self, id: &SessionId) -> Result<bool, ExecutorError> {
        let Some(entry) = self.entry(id) else {
            return match self.store.load(id)? {
                Some(_) => Ok(false),
                None => Err(ExecutorError::SessionNotFound { id: id.clone() }),
            };
        };
        let mut session = entry.lock().await;
        let now = Utc::now();
        if !session.cancel(now) {
            return Ok(false);
        }
        if !self
            .store
            .finish_session(id, SessionStatus::Cancelled, now)?
        {
            self.reload(&mut session)?;
            return Ok(false);
        }
        info!(session = %id, "session cancelled");
        self.emit(SessionEvent::SessionFinished {
            session_id: id.clone(),
            status: SessionStatus::Cancelled,
        });

        let drained = !has_running(&session);
        drop(session);
        if drained {
            self.untrack(id);
        }
        Ok(true)
    }

    /// Pick up RUNNING sessions from the store after a restart
    pub fn recover(&self) -> Result<usize, ExecutorError> {
        let mut recovered = 0;
        for session in self.store.load_active()? {
            if self.entry(&session.id).is_some() {
                continue;
            }
            info!(session = %session.id, key = %session.key, "recovered session");
            self.track(session);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Advance every active session concurrently
    pub async fn advance_all(self: &Arc<Self>) -> Vec<(SessionId, AdvanceReport)> {
        let mut set = JoinSet::new();
        for id in self.active_sessions() {
            let this = Arc::clone(self);
            set.spawn(async move {
                let result = this.advance(&id).await;
                (id, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(report))) => reports.push((id, report)),
                Ok((id, Err(e))) => warn!(session = %id, error = %e, "advance failed"),
                Err(e) => error!(error = %e, "advance task panicked"),
            }
        }
        reports
    }

    /// Handle one completion, logging instead of returning errors
    pub async fn complete(&self, completion: TaskCompletion) {
        match self.handle_completion(&completion).await {
            Ok(_) => {}
            Err(e) if e.is_ignorable() => {
                debug!(lock_id = %completion.lock_id, "ignoring stale completion");
            }
            Err(e) => {
                warn!(lock_id = %completion.lock_id, error = %e, "completion failed");
            }
        }
    }

    /// Periodic advancement plus completion processing until `token` fires
    pub async fn run(
        self: Arc<Self>,
        mut completions: mpsc::Receiver<TaskCompletion>,
        mut token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut handlers = JoinSet::new();
        let mut open = true;

        info!(tick = ?self.config.tick_interval(), queue = self.dispatcher.name(), "executor running");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.advance_all().await;
                }
                completion = completions.recv(), if open => match completion {
                    Some(completion) => {
                        let this = Arc::clone(&self);
                        handlers.spawn(async move { this.complete(completion).await });
                    }
                    None => open = false,
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        while handlers.join_next().await.is_some() {}
        info!("executor stopped");
    }

    fn commit(&self, session: &Session, before: &[TaskState]) -> Result<(), ExecutorError> {
        for prev in before {
            self.commit_task(session, prev)?;
        }
        Ok(())
    }

    /// Write one task state if it changed, guarded by its previous status
    fn commit_task(&self, session: &Session, before: &TaskState) -> Result<(), ExecutorError> {
        let after = &session.tasks[before.index];
        if after == before {
            return Ok(());
        }
        if self
            .store
            .update_task_state(&session.id, before.index, before.status, after)?
        {
            Ok(())
        } else {
            Err(ExecutorError::StaleState {
                session_id: session.id.clone(),
                index: before.index,
            })
        }
    }

    fn load_stored(&self, id: &SessionId) -> Result<Session, ExecutorError> {
        self.store
            .load(id)?
            .ok_or_else(|| ExecutorError::SessionNotFound { id: id.clone() })
    }

    /// Replace the working copy and re-register its lock ids
    fn adopt(&self, session: &mut Session, stored: Session) {
        self.locks().retain(|_, owner| owner != &stored.id);
        self.index_locks(&stored);
        *session = stored;
    }

    fn reload(&self, session: &mut Session) -> Result<(), ExecutorError> {
        let stored = self.load_stored(&session.id)?;
        warn!(session = %session.id, "reloaded session after concurrent update");
        self.adopt(session, stored);
        Ok(())
    }

    /// Adopt the stored copy if another executor has moved the session on
    fn refresh(&self, session: &mut Session) -> Result<bool, ExecutorError> {
        let stored = self.load_stored(&session.id)?;
        if stored.status == session.status && stored.tasks == session.tasks {
            return Ok(false);
        }
        debug!(session = %session.id, status = %stored.status, "session changed in store");
        self.adopt(session, stored);
        Ok(true)
    }
}

/// Record an agent outcome, confirming a pending dispatch first
fn apply_outcome(
    session: &mut Session,
    index: usize,
    outcome: &TaskOutcome,
    now: DateTime<Utc>,
) -> Result<(TaskStatus, Option<String>), TransitionError> {
    if session.tasks[index].lock_id.is_none() {
        session.confirm_pending(index, now)?;
    }
    match outcome {
        TaskOutcome::Success { output } => {
            session.record_success(index, output.clone(), now)?;
            Ok((TaskStatus::Success, None))
        }
        TaskOutcome::Failure { error } => {
            let status = session.record_failure(index, error.clone(), now)?;
            Ok((status, Some(error.clone())))
        }
    }
}

fn has_running(session: &Session) -> bool {
    session.tasks.iter().any(|t| t.lock_id.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::config::{ConfigMap, RetryPolicy, TaskDefinition, WorkflowDefinition};
    use crate::queue::{InProcessQueue, NoopDispatcher, QueueError, TimeoutDispatcher};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn echo(name: &str) -> TaskDefinition {
        TaskDefinition::task(name, "echo")
    }

    fn failing(name: &str) -> TaskDefinition {
        TaskDefinition::task(name, "fail")
    }

    fn graph(def: WorkflowDefinition) -> Arc<CompiledTaskGraph> {
        Arc::new(Compiler::default().compile(&def).unwrap())
    }

    fn time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<InProcessQueue>,
        executor: Arc<WorkflowExecutor>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let queue = Arc::new(InProcessQueue::new());
            let executor = Arc::new(WorkflowExecutor::new(
                store.clone(),
                queue.clone(),
                ExecutorConfig::default(),
            ));
            Self {
                store,
                queue,
                executor,
            }
        }

        /// Play the agent: take every queued task and report on it
        async fn drain(&self, decide: impl Fn(&DispatchRequest) -> TaskOutcome) -> Vec<String> {
            let mut seen = Vec::new();
            while let Some(request) = self.queue.poll("default", "agent-1") {
                seen.push(request.task_name.clone());
                let completion = TaskCompletion {
                    lock_id: request.lock_id.clone(),
                    agent_id: "agent-1".into(),
                    outcome: decide(&request),
                };
                self.executor.handle_completion(&completion).await.unwrap();
            }
            seen
        }
    }

    fn succeed_unless_fail(request: &DispatchRequest) -> TaskOutcome {
        if request.operator == "fail" {
            TaskOutcome::failure("boom")
        } else {
            TaskOutcome::success(ConfigMap::new().with("value", request.task_name.as_str()))
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_succeeds() {
        let h = Harness::new();
        let mut events = h.executor.subscribe();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b"), echo("c")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        assert_eq!(session.status_by_name("+wf+a"), Some(TaskStatus::Running));
        assert_eq!(session.status_by_name("+wf+b"), Some(TaskStatus::Blocked));

        let seen = h.drain(succeed_unless_fail).await;
        assert_eq!(seen, vec!["+wf+a", "+wf+b", "+wf+c"]);

        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
        assert!(h.executor.active_sessions().is_empty());
        assert_eq!(h.queue.in_flight(), 0);

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::SessionFinished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_middle_failure_never_dispatches_downstream() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), failing("b"), echo("c")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        let seen = h.drain(succeed_unless_fail).await;
        assert_eq!(seen, vec!["+wf+a", "+wf+b"]);

        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(done.status_by_name("+wf+b"), Some(TaskStatus::Failed));
        assert_eq!(done.status_by_name("+wf+c"), Some(TaskStatus::Blocked));
    }

    #[tokio::test]
    async fn test_on_error_branch_handles_failure() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![failing("a")]).with_on_error(echo("e"));
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        let seen = h.drain(succeed_unless_fail).await;
        assert_eq!(seen, vec!["+wf+a", "+wf+e"]);

        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::ErrorHandled);
        assert_eq!(done.status_by_name("+wf+a"), Some(TaskStatus::ErrorHandled));
        assert_eq!(done.status_by_name("+wf+e"), Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn test_retry_redispatches_with_fresh_lock() {
        let h = Harness::new();
        let retry = RetryPolicy {
            max_attempts: 2,
            interval_ms: 0,
            ..Default::default()
        };
        let def = WorkflowDefinition::new("wf", vec![failing("a").with_retry(retry)]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        let first = h.queue.poll("default", "agent").unwrap();
        h.executor
            .handle_completion(&TaskCompletion {
                lock_id: first.lock_id.clone(),
                agent_id: "agent".into(),
                outcome: TaskOutcome::failure("flaky"),
            })
            .await
            .unwrap();

        let second = h.queue.poll("default", "agent").unwrap();
        assert_ne!(second.lock_id, first.lock_id);
        assert_eq!(second.attempt, 2);

        h.executor
            .handle_completion(&TaskCompletion {
                lock_id: second.lock_id,
                agent_id: "agent".into(),
                outcome: TaskOutcome::success(ConfigMap::new()),
            })
            .await
            .unwrap();
        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
        assert_eq!(done.tasks[1].attempts, 2);
    }

    #[tokio::test]
    async fn test_duplicate_start_conflicts() {
        let h = Harness::new();
        let g = graph(WorkflowDefinition::new("wf", vec![echo("a")]));
        let slot = time("2026-05-01T00:00:00Z");

        let (first, second) = tokio::join!(
            h.executor
                .start_session("p", g.clone(), slot, AttemptOptions::fresh()),
            h.executor
                .start_session("p", g.clone(), slot, AttemptOptions::fresh()),
        );
        let ok = [first.is_ok(), second.is_ok()];
        assert_eq!(ok.iter().filter(|o| **o).count(), 1);
        let err = (if first.is_err() { first } else { second }).unwrap_err();
        assert!(matches!(err, ExecutorError::SessionConflict { .. }));
        assert_eq!(h.executor.active_sessions().len(), 1);

        // Another slot is independent
        assert!(
            h.executor
                .start_session("p", g, time("2026-05-02T00:00:00Z"), AttemptOptions::fresh())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        let before = h.executor.session(&session.id).await.unwrap().unwrap();

        let err = h
            .executor
            .handle_completion(&TaskCompletion {
                lock_id: "nope".into(),
                agent_id: "agent".into(),
                outcome: TaskOutcome::success(ConfigMap::new()),
            })
            .await
            .unwrap_err();
        assert!(err.is_ignorable());
        let after = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(after.tasks, before.tasks);

        // Duplicate delivery of a finished attempt
        let request = h.queue.poll("default", "agent").unwrap();
        let completion = TaskCompletion {
            lock_id: request.lock_id,
            agent_id: "agent".into(),
            outcome: TaskOutcome::success(ConfigMap::new()),
        };
        h.executor.handle_completion(&completion).await.unwrap();
        let err = h.executor.handle_completion(&completion).await.unwrap_err();
        assert!(matches!(err, ExecutorError::TaskNotFound { .. }));
        let latest = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(latest.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(latest.status_by_name("+wf+b"), Some(TaskStatus::Running));
    }

    /// Counts dispatches per lock and answers from a script
    #[derive(Default)]
    struct Scripted {
        calls: std::sync::Mutex<Vec<String>>,
        script: std::sync::Mutex<VecDeque<Result<(), QueueError>>>,
    }

    impl Scripted {
        fn with_script(script: Vec<Result<(), QueueError>>) -> Self {
            Self {
                calls: Default::default(),
                script: std::sync::Mutex::new(script.into()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskQueueDispatcher for Scripted {
        async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
            tokio::task::yield_now().await;
            self.calls.lock().unwrap().push(request.lock_id.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn task_finished(&self, _: &str, _: &str, _: &str) -> Result<(), QueueError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn executor_with(dispatcher: Arc<dyn TaskQueueDispatcher>) -> Arc<WorkflowExecutor> {
        Arc::new(WorkflowExecutor::new(
            Arc::new(MemoryStore::new()),
            dispatcher,
            ExecutorConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_concurrent_advance_never_double_dispatches() {
        // The first round of dispatches is refused so every task stays READY
        let dispatcher = Arc::new(Scripted::with_script(vec![
            Err(QueueError::conflict("a")),
            Err(QueueError::conflict("b")),
            Err(QueueError::conflict("c")),
        ]));
        let executor = executor_with(dispatcher.clone());
        let mut def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b"), echo("c")]);
        def.parallel = true;
        let session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        assert_eq!(session.status_by_name("+wf+b"), Some(TaskStatus::Ready));

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let executor = Arc::clone(&executor);
            let id = session.id.clone();
            set.spawn(async move { executor.advance(&id).await.unwrap() });
        }
        let mut dispatched = 0;
        while let Some(report) = set.join_next().await {
            dispatched += report.unwrap().dispatched;
        }
        assert_eq!(dispatched, 3);

        let snapshot = executor.session(&session.id).await.unwrap().unwrap();
        for name in ["+wf+a", "+wf+b", "+wf+c"] {
            assert_eq!(snapshot.status_by_name(name), Some(TaskStatus::Running));
        }
        // Three refused tries plus exactly one accepted dispatch per task
        let mut calls = dispatcher.calls();
        assert_eq!(calls.len(), 6);
        calls.sort();
        calls.dedup();
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_conflict_and_timeout_leave_task_ready() {
        let dispatcher = Arc::new(Scripted::with_script(vec![
            Err(QueueError::conflict("x")),
            Err(QueueError::Timeout {
                elapsed: Duration::from_millis(5),
            }),
        ]));
        let executor = executor_with(dispatcher.clone());
        let def = WorkflowDefinition::new("wf", vec![echo("a")]);
        let session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        assert_eq!(session.status_by_name("+wf+a"), Some(TaskStatus::Ready));

        let report = executor.advance(&session.id).await.unwrap();
        assert_eq!(report.deferred, 1);

        let report = executor.advance(&session.id).await.unwrap();
        assert_eq!(report.dispatched, 1);
        let snapshot = executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status_by_name("+wf+a"), Some(TaskStatus::Running));
        assert_eq!(snapshot.tasks[1].attempts, 0);
        // All three tries used the same lock id for the same attempt
        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c == &calls[0]));
    }

    #[tokio::test]
    async fn test_stalled_queue_times_out_without_failing_task() {
        struct Stalled;

        #[async_trait]
        impl TaskQueueDispatcher for Stalled {
            async fn dispatch(&self, _: &DispatchRequest) -> Result<(), QueueError> {
                std::future::pending().await
            }
            async fn task_finished(&self, _: &str, _: &str, _: &str) -> Result<(), QueueError> {
                Ok(())
            }
            fn name(&self) -> &str {
                "stalled"
            }
        }

        let executor = executor_with(Arc::new(TimeoutDispatcher::new(
            Stalled,
            Duration::from_millis(10),
        )));
        let def = WorkflowDefinition::new("wf", vec![echo("a")]);
        let session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        assert_eq!(session.status_by_name("+wf+a"), Some(TaskStatus::Ready));
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_queue_error_is_a_task_failure() {
        let dispatcher = Arc::new(Scripted::with_script(vec![Err(QueueError::unavailable(
            "down",
        ))]));
        let executor = executor_with(dispatcher);
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.status_by_name("+wf+a"), Some(TaskStatus::Failed));
        assert!(
            session.tasks[1]
                .last_error
                .as_deref()
                .unwrap()
                .contains("down")
        );
    }

    #[tokio::test]
    async fn test_noop_dispatcher_bookkeeping() {
        let executor = executor_with(Arc::new(NoopDispatcher::new()));
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let mut session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        for name in ["+wf+a", "+wf+b"] {
            let index = session.graph.find(name).unwrap().index;
            let lock_id = session.tasks[index].lock_id.clone().unwrap();
            executor
                .handle_completion(&TaskCompletion {
                    lock_id,
                    agent_id: "agent".into(),
                    outcome: TaskOutcome::success(ConfigMap::new()),
                })
                .await
                .unwrap();
            session = executor.session(&session.id).await.unwrap().unwrap();
        }
        assert_eq!(session.status, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_failed_resumes_with_outputs() {
        let h = Harness::new();
        let b = failing("b").with_config(ConfigMap::new().with("message", "{{ tasks.a.value }}"));
        let def = WorkflowDefinition::new("wf", vec![echo("a"), b, echo("c")]);
        let g = graph(def);
        let slot = time("2026-06-01T00:00:00Z");

        let first = h
            .executor
            .start_session("p", g.clone(), slot, AttemptOptions::fresh())
            .await
            .unwrap();
        h.drain(succeed_unless_fail).await;
        assert_eq!(
            h.executor.session(&first.id).await.unwrap().unwrap().status,
            SessionStatus::Failed
        );

        let second = h
            .executor
            .start_session("p", g.clone(), slot, AttemptOptions::retry_failed())
            .await
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(second.status_by_name("+wf+b"), Some(TaskStatus::Running));

        // Only b and c run again, and b still sees a's output
        let seen = h
            .drain(|request| {
                if request.task_name == "+wf+b" {
                    assert_eq!(request.config.get_str("message").unwrap(), "+wf+a");
                }
                TaskOutcome::success(ConfigMap::new())
            })
            .await;
        assert_eq!(seen, vec!["+wf+b", "+wf+c"]);
        assert_eq!(
            h.executor.session(&second.id).await.unwrap().unwrap().status,
            SessionStatus::Success
        );

        // Nothing left to retry
        let err = h
            .executor
            .start_session("p", g, slot, AttemptOptions::retry_failed())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_attempt() {
        let h = Harness::new();
        let g = graph(WorkflowDefinition::new("wf", vec![echo("a")]));
        let slot = time("2026-06-01T00:00:00Z");
        h.executor
            .start_session("p", g.clone(), slot, AttemptOptions::fresh())
            .await
            .unwrap();

        for options in [AttemptOptions::retry_failed(), AttemptOptions::retry_all()] {
            let err = h
                .executor
                .start_session("p", g.clone(), slot, options)
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutorError::SessionConflict { .. }));
        }

        h.drain(succeed_unless_fail).await;
        let rerun = h
            .executor
            .start_session("p", g, slot, AttemptOptions::retry_all())
            .await
            .unwrap();
        assert_eq!(rerun.attempt, 2);
        assert_eq!(rerun.status_by_name("+wf+a"), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch_but_records_running() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        assert!(h.executor.cancel_session(&session.id).await.unwrap());
        assert!(!h.executor.cancel_session(&session.id).await.unwrap());

        let seen = h.drain(succeed_unless_fail).await;
        assert_eq!(seen, vec!["+wf+a"]);

        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Cancelled);
        assert_eq!(done.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(done.status_by_name("+wf+b"), Some(TaskStatus::Blocked));
        assert!(h.executor.active_sessions().is_empty());

        let missing = h.executor.cancel_session(&SessionId::from("nope")).await;
        assert!(matches!(missing, Err(ExecutorError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_recover_after_restart() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        // A fresh executor over the same store and queue
        let restarted = Arc::new(WorkflowExecutor::new(
            h.store.clone(),
            h.queue.clone(),
            ExecutorConfig::default(),
        ));
        assert_eq!(restarted.recover().unwrap(), 1);
        assert_eq!(restarted.recover().unwrap(), 0);

        let h = Harness {
            store: h.store,
            queue: h.queue,
            executor: restarted,
        };
        let seen = h.drain(succeed_unless_fail).await;
        assert_eq!(seen, vec!["+wf+a", "+wf+b"]);
        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
    }

    fn completed(lock_id: impl Into<String>) -> TaskCompletion {
        TaskCompletion {
            lock_id: lock_id.into(),
            agent_id: "agent".into(),
            outcome: TaskOutcome::success(ConfigMap::new()),
        }
    }

    /// Enqueues every request but reports the first one as timed out
    struct SlowAck {
        queue: Arc<InProcessQueue>,
        acked: AtomicBool,
    }

    impl SlowAck {
        fn new(queue: Arc<InProcessQueue>) -> Self {
            Self {
                queue,
                acked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TaskQueueDispatcher for SlowAck {
        async fn dispatch(&self, request: &DispatchRequest) -> Result<(), QueueError> {
            self.queue.dispatch(request).await?;
            if self.acked.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                Err(QueueError::Timeout {
                    elapsed: Duration::from_millis(5),
                })
            }
        }

        async fn task_finished(
            &self,
            site_id: &str,
            lock_id: &str,
            agent_id: &str,
        ) -> Result<(), QueueError> {
            self.queue.task_finished(site_id, lock_id, agent_id).await
        }

        fn session_closed(&self, session_id: &str) {
            self.queue.session_closed(session_id);
        }

        fn name(&self) -> &str {
            "slow-ack"
        }
    }

    #[tokio::test]
    async fn test_timed_out_dispatch_accepted_by_queue_completes() {
        let queue = Arc::new(InProcessQueue::new());
        let executor = executor_with(Arc::new(SlowAck::new(queue.clone())));
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        let a = session.graph.find("+wf+a").unwrap().index;
        assert_eq!(session.tasks[a].status, TaskStatus::Ready);
        assert_eq!(session.tasks[a].lock_id, None);
        let pending = session.tasks[a].pending_lock.clone().unwrap();
        assert_eq!(queue.pending("default"), 1);

        // Re-sending conflicts with the copy the queue already holds
        let report = executor.advance(&session.id).await.unwrap();
        assert_eq!(
            report,
            AdvanceReport {
                dispatched: 0,
                deferred: 1,
                finished: None,
            }
        );
        assert_eq!(queue.pending("default"), 1);

        let request = queue.poll("default", "agent").unwrap();
        assert_eq!(request.lock_id, pending);
        let status = executor
            .handle_completion(&completed(request.lock_id))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Success);

        let request = queue.poll("default", "agent").unwrap();
        assert_eq!(request.task_name, "+wf+b");
        executor
            .handle_completion(&completed(request.lock_id))
            .await
            .unwrap();

        let done = executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
        assert!(done.tasks.iter().all(|t| t.pending_lock.is_none()));
        assert!(executor.active_sessions().is_empty());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.released(), 0);
    }

    #[tokio::test]
    async fn test_pending_dispatch_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(InProcessQueue::new());
        let first = WorkflowExecutor::new(
            store.clone(),
            Arc::new(SlowAck::new(queue.clone())),
            ExecutorConfig::default(),
        );
        let def = WorkflowDefinition::new("wf", vec![echo("a")]);
        let session = first
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        drop(first);

        let restarted = WorkflowExecutor::new(store, queue.clone(), ExecutorConfig::default());
        assert_eq!(restarted.recover().unwrap(), 1);

        let request = queue.poll("default", "agent").unwrap();
        restarted
            .handle_completion(&completed(request.lock_id))
            .await
            .unwrap();
        let done = restarted.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
        assert_eq!(done.status_by_name("+wf+a"), Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn test_second_executor_follows_store() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        let other = WorkflowExecutor::new(h.store.clone(), h.queue.clone(), ExecutorConfig::default());
        assert_eq!(other.recover().unwrap(), 1);

        let first = h.queue.poll("default", "agent").unwrap();
        h.executor
            .handle_completion(&completed(first.lock_id))
            .await
            .unwrap();

        // The other copy still has a RUNNING until it reads the store
        let report = other.advance(&session.id).await.unwrap();
        assert_eq!(report, AdvanceReport::default());
        let copy = other.session(&session.id).await.unwrap().unwrap();
        assert_eq!(copy.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(copy.status_by_name("+wf+b"), Some(TaskStatus::Running));
        assert_eq!(h.queue.pending("default"), 1);

        // Either executor can take b's completion now
        let second = h.queue.poll("default", "agent").unwrap();
        let status = other
            .handle_completion(&completed(second.lock_id))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Success);
        assert!(other.active_sessions().is_empty());

        let report = h.executor.advance(&session.id).await.unwrap();
        assert_eq!(report, AdvanceReport::default());
        assert!(h.executor.active_sessions().is_empty());
        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_completion_on_stale_copy_reloads() {
        let h = Harness::new();
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();
        let other = WorkflowExecutor::new(h.store.clone(), h.queue.clone(), ExecutorConfig::default());
        assert_eq!(other.recover().unwrap(), 1);

        let request = h.queue.poll("default", "agent").unwrap();
        let completion = completed(request.lock_id);
        other.handle_completion(&completion).await.unwrap();

        // The first executor's write is refused against the stored state
        let err = h.executor.handle_completion(&completion).await.unwrap_err();
        assert!(matches!(err, ExecutorError::StaleState { .. }));
        let copy = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(copy.status_by_name("+wf+a"), Some(TaskStatus::Success));
        assert_eq!(copy.status_by_name("+wf+b"), Some(TaskStatus::Running));
        assert_eq!(h.queue.pending("default"), 1);

        // After the reload the old lock is simply unknown
        let err = h.executor.handle_completion(&completion).await.unwrap_err();
        assert!(err.is_ignorable());
    }

    #[tokio::test]
    async fn test_run_loop_processes_completions() {
        let h = Harness::new();
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&h.executor).run(rx, token.clone()));

        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("b")]);
        let session = h
            .executor
            .start_session("p", graph(def), Utc::now(), AttemptOptions::fresh())
            .await
            .unwrap();

        let mut events = h.executor.subscribe();
        for _ in 0..2 {
            let request = h
                .queue
                .poll_wait("default", "agent", Duration::from_secs(5))
                .await
                .unwrap();
            tx.send(TaskCompletion {
                lock_id: request.lock_id,
                agent_id: "agent".into(),
                outcome: TaskOutcome::success(ConfigMap::new()),
            })
            .await
            .unwrap();
        }

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SessionEvent::SessionFinished { status, .. }) = events.recv().await {
                    return status;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status, SessionStatus::Success);

        token.cancel();
        runner.await.unwrap();
        let done = h.executor.session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
    }
}
