//! SQLite-backed session and schedule store

use super::schema::init_schema;
use super::{ScheduleStore, SessionStore, StoreError};
use crate::compiler::CompiledTaskGraph;
use crate::config::ConfigMap;
use crate::session::{Session, SessionId, SessionKey, SessionStatus, TaskState, TaskStatus};
use crate::trigger::{RecurrenceRule, ScheduleEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Fixed-width UTC timestamps so text order equals time order
fn ts(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(time: &Option<DateTime<Utc>>) -> Option<String> {
    time.as_ref().map(ts)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("bad timestamp '{}': {}", text, e)))
}

fn parse_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    text.as_deref().map(parse_ts).transpose()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

struct SessionRow {
    id: String,
    project: String,
    workflow: String,
    session_time: String,
    attempt: u32,
    status: String,
    params: String,
    graph: String,
    created_at: String,
    finished_at: Option<String>,
}

struct TaskRow {
    idx: i64,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    output: Option<String>,
    lock_id: Option<String>,
    pending_lock: Option<String>,
    retry_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            idx: row.get(0)?,
            status: row.get(1)?,
            attempts: row.get(2)?,
            last_error: row.get(3)?,
            output: row.get(4)?,
            lock_id: row.get(5)?,
            pending_lock: row.get(6)?,
            retry_at: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_state(self) -> Result<TaskState, StoreError> {
        let output = self
            .output
            .as_deref()
            .map(serde_json::from_str::<ConfigMap>)
            .transpose()?;
        Ok(TaskState {
            index: usize::try_from(self.idx)
                .map_err(|_| StoreError::corrupt(format!("bad task index {}", self.idx)))?,
            status: self.status.parse().map_err(StoreError::corrupt)?,
            attempts: self.attempts,
            last_error: self.last_error,
            output,
            lock_id: self.lock_id,
            pending_lock: self.pending_lock,
            retry_at: parse_opt_ts(self.retry_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
        })
    }
}

type ScheduleRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn schedule_from_row(row: ScheduleRow) -> Result<ScheduleEntry, StoreError> {
    let (id, project, workflow, rule, next_run_time, last_session, last_session_time) = row;
    Ok(ScheduleEntry {
        id,
        project,
        workflow,
        rule: serde_json::from_str::<RecurrenceRule>(&rule)?,
        next_run_time: parse_ts(&next_run_time)?,
        last_session: last_session.map(SessionId::from),
        last_session_time: parse_opt_ts(last_session_time)?,
    })
}

const SCHEDULE_COLUMNS: &str =
    "id, project, workflow, rule, next_run_time, last_session_id, last_session_time";

/// Durable store shared by executors on one host
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Config {
                    message: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "opened session store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_with(conn: &Connection, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, project, workflow, session_time, attempt, status, params, graph,
                        created_at, finished_at
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        project: row.get(1)?,
                        workflow: row.get(2)?,
                        session_time: row.get(3)?,
                        attempt: row.get(4)?,
                        status: row.get(5)?,
                        params: row.get(6)?,
                        graph: row.get(7)?,
                        created_at: row.get(8)?,
                        finished_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT idx, status, attempts, last_error, output, lock_id, pending_lock, retry_at,
                    started_at, finished_at
             FROM task_states WHERE session_id = ?1 ORDER BY idx",
        )?;
        let tasks = stmt
            .query_map(params![session_id], TaskRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(TaskRow::into_state)
            .collect::<Result<Vec<_>, _>>()?;

        let graph: CompiledTaskGraph = serde_json::from_str(&row.graph)?;
        if graph.len() != tasks.len() {
            return Err(StoreError::corrupt(format!(
                "session {} has {} task states for {} nodes",
                row.id,
                tasks.len(),
                graph.len()
            )));
        }

        Ok(Some(Session {
            id: SessionId::from(row.id),
            key: SessionKey::new(row.project, row.workflow, parse_ts(&row.session_time)?),
            attempt: row.attempt,
            graph: Arc::new(graph),
            tasks,
            status: row.status.parse().map_err(StoreError::corrupt)?,
            params: serde_json::from_str(&row.params)?,
            created_at: parse_ts(&row.created_at)?,
            finished_at: parse_opt_ts(row.finished_at)?,
        }))
    }
}

impl SessionStore for SqliteStore {
    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO sessions (id, project, workflow, session_time, attempt, status, params,
                                   graph, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id.as_str(),
                session.key.project,
                session.key.workflow,
                ts(&session.key.session_time),
                session.attempt,
                session.status.as_str(),
                serde_json::to_string(&session.params)?,
                serde_json::to_string(session.graph.as_ref())?,
                ts(&session.created_at),
                opt_ts(&session.finished_at),
            ],
        );
        match inserted {
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::DuplicateSession {
                    key: session.key.to_string(),
                    attempt: session.attempt,
                });
            }
            other => {
                other?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_states (session_id, idx, status, attempts, last_error, output,
                                          lock_id, pending_lock, retry_at, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for task in &session.tasks {
                let output = task.output.as_ref().map(serde_json::to_string).transpose()?;
                stmt.execute(params![
                    session.id.as_str(),
                    task.index as i64,
                    task.status.as_str(),
                    task.attempts,
                    task.last_error,
                    output,
                    task.lock_id,
                    task.pending_lock,
                    opt_ts(&task.retry_at),
                    opt_ts(&task.started_at),
                    opt_ts(&task.finished_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn update_task_state(
        &self,
        session_id: &SessionId,
        index: usize,
        expected: TaskStatus,
        state: &TaskState,
    ) -> Result<bool, StoreError> {
        let output = state.output.as_ref().map(serde_json::to_string).transpose()?;
        let changed = self.conn().execute(
            "UPDATE task_states
             SET status = ?1, attempts = ?2, last_error = ?3, output = ?4, lock_id = ?5,
                 pending_lock = ?6, retry_at = ?7, started_at = ?8, finished_at = ?9
             WHERE session_id = ?10 AND idx = ?11 AND status = ?12",
            params![
                state.status.as_str(),
                state.attempts,
                state.last_error,
                output,
                state.lock_id,
                state.pending_lock,
                opt_ts(&state.retry_at),
                opt_ts(&state.started_at),
                opt_ts(&state.finished_at),
                session_id.as_str(),
                index as i64,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn finish_session(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE sessions SET status = ?1, finished_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                status.as_str(),
                ts(&finished_at),
                session_id.as_str(),
                SessionStatus::Running.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        Self::load_with(&self.conn(), session_id.as_str())
    }

    fn latest_attempt(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        let conn = self.conn();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions
                 WHERE project = ?1 AND workflow = ?2 AND session_time = ?3
                 ORDER BY attempt DESC LIMIT 1",
                params![key.project, key.workflow, ts(&key.session_time)],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Self::load_with(&conn, &id),
            None => Ok(None),
        }
    }

    fn load_active(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn();
        let ids = {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions WHERE status = ?1 ORDER BY created_at")?;
            stmt.query_map(params![SessionStatus::Running.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = Self::load_with(&conn, &id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

impl ScheduleStore for SqliteStore {
    fn register(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT OR REPLACE INTO schedules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                SCHEDULE_COLUMNS
            ),
            params![
                entry.id,
                entry.project,
                entry.workflow,
                serde_json::to_string(&entry.rule)?,
                ts(&entry.next_run_time),
                entry.last_session.as_ref().map(SessionId::as_str),
                opt_ts(&entry.last_session_time),
            ],
        )?;
        Ok(())
    }

    fn next_due_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules WHERE next_run_time <= ?1 ORDER BY next_run_time",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![ts(&now)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<ScheduleRow>>>()?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    fn update_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE schedules
             SET rule = ?1, next_run_time = ?2, last_session_id = ?3, last_session_time = ?4
             WHERE id = ?5",
            params![
                serde_json::to_string(&entry.rule)?,
                ts(&entry.next_run_time),
                entry.last_session.as_ref().map(SessionId::as_str),
                opt_ts(&entry.last_session_time),
                entry.id,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, project: &str, workflow: &str) -> Result<bool, StoreError> {
        let removed = self.conn().execute(
            "DELETE FROM schedules WHERE project = ?1 AND workflow = ?2",
            params![project, workflow],
        )?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules ORDER BY project, workflow",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<ScheduleRow>>>()?;
        rows.into_iter().map(schedule_from_row).collect()
    }
}
