//! SQLite schema for sessions and schedules

use rusqlite::Connection;

/// Create tables if missing
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            workflow TEXT NOT NULL,
            session_time TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            params TEXT NOT NULL,
            graph TEXT NOT NULL,
            created_at TEXT NOT NULL,
            finished_at TEXT,
            UNIQUE(project, workflow, session_time, attempt)
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

        CREATE TABLE IF NOT EXISTS task_states (
            session_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT,
            output TEXT,
            lock_id TEXT,
            pending_lock TEXT,
            retry_at TEXT,
            started_at TEXT,
            finished_at TEXT,
            PRIMARY KEY(session_id, idx),
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_task_states_lock ON task_states(lock_id);

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            workflow TEXT NOT NULL,
            rule TEXT NOT NULL,
            next_run_time TEXT NOT NULL,
            last_session_id TEXT,
            last_session_time TEXT,
            UNIQUE(project, workflow)
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run_time);
        "#,
    )
}
