//! Persistence boundaries for sessions, schedules and workflow definitions
//!
//! Store calls are short and synchronous. Implementations must make
//! [`SessionStore::update_task_state`] an atomic compare-and-set so that
//! executors sharing one store never apply the same transition twice.

mod error;
mod file;
mod memory;
mod schema;
mod sqlite;

pub use error::StoreError;
pub use file::FileProjectStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackend, StoreConfig, WorkflowDefinition};
use crate::session::{Session, SessionId, SessionKey, SessionStatus, TaskState, TaskStatus};
use crate::trigger::ScheduleEntry;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Session and task state persistence
pub trait SessionStore: Send + Sync {
    /// Insert a newly started session with all of its task states
    ///
    /// Fails with [`StoreError::DuplicateSession`] if the same attempt of the
    /// same slot already exists.
    fn persist(&self, session: &Session) -> Result<(), StoreError>;

    /// Replace one task state if its stored status is still `expected`
    ///
    /// Returns false when another writer got there first.
    fn update_task_state(
        &self,
        session_id: &SessionId,
        index: usize,
        expected: TaskStatus,
        state: &TaskState,
    ) -> Result<bool, StoreError>;

    /// Move a RUNNING session to a terminal status; false if it already was
    fn finish_session(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Highest attempt recorded for a slot
    fn latest_attempt(&self, key: &SessionKey) -> Result<Option<Session>, StoreError>;

    /// Every session still RUNNING
    fn load_active(&self) -> Result<Vec<Session>, StoreError>;
}

/// Workflow definitions by project
pub trait ProjectStore: Send + Sync {
    fn load(&self, project: &str, workflow: &str) -> Result<WorkflowDefinition, StoreError>;
}

/// Schedule entry persistence
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the entry for its (project, workflow)
    fn register(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    /// Entries whose next run time is at or before `now`, oldest first
    fn next_due_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError>;

    fn update_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    /// Drop the entry for (project, workflow); false if there was none
    fn remove(&self, project: &str, workflow: &str) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError>;
}

/// Session and schedule stores opened from configuration
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}

impl Stores {
    fn shared<T: SessionStore + ScheduleStore + 'static>(store: T) -> Self {
        let store = Arc::new(store);
        Self {
            sessions: store.clone(),
            schedules: store,
        }
    }
}

/// Open the configured session/schedule store
pub fn create_store(config: &StoreConfig) -> Result<Stores, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Stores::shared(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config.resolved_path().ok_or_else(|| StoreError::Config {
                message: "store.path is required for the sqlite backend".into(),
            })?;
            Ok(Stores::shared(SqliteStore::open(&path)?))
        }
    }
}
