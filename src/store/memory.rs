//! In-memory stores

use super::{ProjectStore, ScheduleStore, SessionStore, StoreError};
use crate::config::WorkflowDefinition;
use crate::session::{Session, SessionId, SessionKey, SessionStatus, TaskState, TaskStatus};
use crate::trigger::ScheduleEntry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, Session>,
    schedules: Vec<ScheduleEntry>,
    workflows: HashMap<(String, String), WorkflowDefinition>,
}

/// Process-local store for sessions, schedules and workflow definitions
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a workflow definition loadable by `ProjectStore::load`
    pub fn add_workflow(&self, project: impl Into<String>, definition: WorkflowDefinition) {
        self.state()
            .workflows
            .insert((project.into(), definition.name.clone()), definition);
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }
}

impl SessionStore for MemoryStore {
    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state();
        let duplicate = state
            .sessions
            .values()
            .any(|s| s.key == session.key && s.attempt == session.attempt);
        if duplicate || state.sessions.contains_key(&session.id) {
            return Err(StoreError::DuplicateSession {
                key: session.key.to_string(),
                attempt: session.attempt,
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn update_task_state(
        &self,
        session_id: &SessionId,
        index: usize,
        expected: TaskStatus,
        task: &TaskState,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(stored) = state
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.tasks.get_mut(index))
        else {
            return Ok(false);
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = task.clone();
        Ok(true)
    }

    fn finish_session(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.sessions.get_mut(session_id) {
            Some(session) if !session.is_terminal() => {
                session.status = status;
                session.finished_at = Some(finished_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.state().sessions.get(session_id).cloned())
    }

    fn latest_attempt(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        Ok(self
            .state()
            .sessions
            .values()
            .filter(|s| &s.key == key)
            .max_by_key(|s| s.attempt)
            .cloned())
    }

    fn load_active(&self) -> Result<Vec<Session>, StoreError> {
        let mut active: Vec<Session> = self
            .state()
            .sessions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }
}

impl ScheduleStore for MemoryStore {
    fn register(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let mut state = self.state();
        state
            .schedules
            .retain(|e| !(e.project == entry.project && e.workflow == entry.workflow));
        state.schedules.push(entry.clone());
        Ok(())
    }

    fn next_due_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut due: Vec<ScheduleEntry> = self
            .state()
            .schedules
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_run_time);
        Ok(due)
    }

    fn update_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(stored) = state.schedules.iter_mut().find(|e| e.id == entry.id) {
            *stored = entry.clone();
        }
        Ok(())
    }

    fn remove(&self, project: &str, workflow: &str) -> Result<bool, StoreError> {
        let mut state = self.state();
        let before = state.schedules.len();
        state
            .schedules
            .retain(|e| !(e.project == project && e.workflow == workflow));
        Ok(state.schedules.len() != before)
    }

    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self.state().schedules.clone())
    }
}

impl ProjectStore for MemoryStore {
    fn load(&self, project: &str, workflow: &str) -> Result<WorkflowDefinition, StoreError> {
        self.state()
            .workflows
            .get(&(project.to_string(), workflow.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound {
                project: project.into(),
                workflow: workflow.into(),
            })
    }
}
