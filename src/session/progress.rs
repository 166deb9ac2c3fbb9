//! Task state machine
//!
//! Every status change on a [`Session`] goes through here. Operator tasks
//! move on dispatch and on agent-reported outcomes; groups and readiness are
//! derived by [`Session::promote`], which runs to a fixpoint.

use super::model::Session;
use super::status::{SessionStatus, TaskStatus, TransitionError};
use crate::compiler::CompiledTaskGraph;
use crate::config::ConfigMap;
use crate::template::{SessionInfo, TemplateContext};
use chrono::{DateTime, Utc};
use std::sync::Arc;

impl Session {
    fn transition(&mut self, index: usize, to: TaskStatus) -> Result<(), TransitionError> {
        let task = self
            .tasks
            .get_mut(index)
            .ok_or(TransitionError::UnknownTask { index })?;
        if !task.status.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                index,
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::SessionTerminal {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Operator tasks currently eligible for dispatch
    pub fn dispatchable(&self) -> Vec<usize> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.graph
            .operator_tasks()
            .filter(|n| self.tasks[n.index].status == TaskStatus::Ready)
            .map(|n| n.index)
            .collect()
    }

    /// Derive readiness and group completion until nothing changes
    ///
    /// Returns the operator tasks that are ready for dispatch afterwards.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Vec<usize> {
        if self.is_terminal() {
            return Vec::new();
        }
        let graph = Arc::clone(&self.graph);

        loop {
            let mut changed = false;

            for node in &graph.nodes {
                let i = node.index;
                let status = self.tasks[i].status;
                match status {
                    TaskStatus::RetryWaiting
                        if self.tasks[i].retry_at.is_none_or(|at| at <= now) =>
                    {
                        self.tasks[i].status = TaskStatus::Ready;
                        self.tasks[i].retry_at = None;
                        changed = true;
                    }
                    TaskStatus::Blocked if self.is_ready(&graph, i) => {
                        self.tasks[i].status = TaskStatus::Ready;
                        changed = true;
                    }
                    _ => {}
                }
                if node.is_group() && self.tasks[i].status == TaskStatus::Ready {
                    self.tasks[i].status = TaskStatus::Running;
                    self.tasks[i].started_at = Some(now);
                    changed = true;
                }
            }

            // Children settle before their parents
            for node in graph.nodes.iter().rev() {
                let i = node.index;
                if !node.is_group() || self.tasks[i].status != TaskStatus::Running {
                    continue;
                }
                if let Some(outcome) = self.group_outcome(&graph, i) {
                    self.tasks[i].status = outcome;
                    self.tasks[i].finished_at = Some(now);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        self.dispatchable()
    }

    fn is_ready(&self, graph: &CompiledTaskGraph, index: usize) -> bool {
        let Some(p) = graph.nodes[index].parent else {
            return false;
        };
        if self.tasks[p].status != TaskStatus::Running {
            return false;
        }
        let parent = &graph.nodes[p];

        if parent.error_child == Some(index) {
            // Armed by a routed operator failure, never by a group settling
            return graph.operator_tasks().any(|n| {
                n.error_handler == Some(index)
                    && self.tasks[n.index].status == TaskStatus::ErrorHandled
            });
        }
        if parent.parallel {
            return true;
        }
        parent
            .regular_children()
            .take_while(|c| *c != index)
            .all(|c| self.tasks[c].status == TaskStatus::Success)
    }

    fn group_outcome(&self, graph: &CompiledTaskGraph, index: usize) -> Option<TaskStatus> {
        let node = &graph.nodes[index];
        let status = |c: usize| self.tasks[c].status;

        if node.children.iter().any(|c| status(*c).is_in_progress()) {
            return None;
        }
        if node.regular_children().all(|c| status(c) == TaskStatus::Success) {
            return Some(TaskStatus::Success);
        }
        if node.children.iter().any(|c| status(*c) == TaskStatus::Failed) {
            return Some(TaskStatus::Failed);
        }
        if node
            .children
            .iter()
            .any(|c| status(*c) == TaskStatus::ErrorHandled)
        {
            return Some(TaskStatus::ErrorHandled);
        }
        None
    }

    /// READY -> RUNNING after the dispatcher accepted the task
    pub fn mark_dispatched(
        &mut self,
        index: usize,
        lock_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.transition(index, TaskStatus::Running)?;
        let task = &mut self.tasks[index];
        task.lock_id = Some(lock_id.into());
        task.pending_lock = None;
        task.started_at = Some(now);
        Ok(())
    }

    /// Remember a dispatch whose acceptance by the queue is unknown
    pub fn mark_pending(&mut self, index: usize, lock_id: impl Into<String>) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.pending_lock = Some(lock_id.into());
        }
    }

    /// READY -> RUNNING for a pending dispatch the queue turned out to accept
    ///
    /// Unlike [`mark_dispatched`](Self::mark_dispatched) this is allowed on a
    /// cancelled session, since the dispatch happened before cancellation.
    pub fn confirm_pending(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let lock_id = self
            .tasks
            .get(index)
            .and_then(|t| t.pending_lock.clone())
            .ok_or(TransitionError::UnknownTask { index })?;
        self.transition(index, TaskStatus::Running)?;
        let task = &mut self.tasks[index];
        task.lock_id = Some(lock_id);
        task.pending_lock = None;
        task.started_at = Some(now);
        Ok(())
    }

    /// RUNNING -> SUCCESS with the agent's output
    pub fn record_success(
        &mut self,
        index: usize,
        output: ConfigMap,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(index, TaskStatus::Success)?;
        let task = &mut self.tasks[index];
        task.attempts += 1;
        task.output = Some(output);
        task.lock_id = None;
        task.finished_at = Some(now);
        Ok(())
    }

    /// RUNNING or READY -> ERROR, then straight on to the resolved status
    ///
    /// Retries come first; once exhausted the failure is routed to the
    /// node's error handler if it has one, otherwise it is final. A late
    /// failure on a cancelled session is final straight away.
    pub fn record_failure(
        &mut self,
        index: usize,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TransitionError> {
        let cancelled = self.is_terminal();
        self.transition(index, TaskStatus::Error)?;
        let node = &self.graph.nodes[index];
        let retry = node.retry.clone();
        let has_handler = node.error_handler.is_some();

        let task = &mut self.tasks[index];
        task.attempts += 1;
        task.last_error = Some(error.into());
        task.lock_id = None;
        task.pending_lock = None;
        let attempts = task.attempts;

        let next = if cancelled {
            TaskStatus::Failed
        } else if retry.allows_retry(attempts) {
            let delay = chrono::Duration::from_std(retry.delay_for_attempt(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.tasks[index].retry_at = Some(now + delay);
            TaskStatus::RetryWaiting
        } else if has_handler {
            TaskStatus::ErrorHandled
        } else {
            TaskStatus::Failed
        };

        self.transition(index, next)?;
        if next.is_terminal() {
            self.tasks[index].finished_at = Some(now);
        }
        Ok(next)
    }

    /// Settle the session from the root, at most once
    ///
    /// Returns the outcome only on the call that made the session terminal.
    pub fn try_finalize(&mut self, now: DateTime<Utc>) -> Option<SessionStatus> {
        if self.is_terminal() {
            return None;
        }
        let outcome = SessionStatus::from_root(self.tasks[CompiledTaskGraph::ROOT].status)?;
        self.status = outcome;
        self.finished_at = Some(now);
        Some(outcome)
    }

    /// Stop further dispatch; running tasks are left alone
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = SessionStatus::Cancelled;
        self.finished_at = Some(now);
        true
    }

    /// Carry over successful work from an earlier attempt
    ///
    /// Nodes are matched by full name so a newer revision of the workflow
    /// can resume an older attempt. Error branches always run again.
    pub fn resume_from(&mut self, previous: &Session) {
        let graph = Arc::clone(&self.graph);
        for node in &graph.nodes {
            if node.is_root() || node.is_error_branch {
                continue;
            }
            let Some(prev_node) = previous.graph.find(&node.full_name) else {
                continue;
            };
            if prev_node.is_group() != node.is_group() {
                continue;
            }
            let prev = &previous.tasks[prev_node.index];
            if prev.status == TaskStatus::Success {
                let task = &mut self.tasks[node.index];
                task.status = TaskStatus::Success;
                task.attempts = prev.attempts;
                task.output = prev.output.clone();
                task.started_at = prev.started_at;
                task.finished_at = prev.finished_at;
            }
        }
    }

    /// Render context for a task: variables, upstream outputs, session info
    pub fn template_context(&self, index: usize) -> TemplateContext {
        let mut vars = self.graph.variables.clone();
        vars.extend_from(&self.params);
        let mut ctx = TemplateContext::with_vars(vars);

        if let Some(node) = self.graph.node(index) {
            for up in &node.upstream {
                let output = self.tasks[*up].output.clone().unwrap_or_default();
                ctx.add_task_output(self.graph.nodes[*up].name.clone(), output);
            }
        }

        ctx.set_session(SessionInfo::new(
            self.id.to_string(),
            self.key.session_time,
            self.attempt,
            self.key.workflow.clone(),
            self.key.project.clone(),
        ));
        ctx
    }
}
