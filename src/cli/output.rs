//! Rendering of session events for the CLI
//!
//! Console mode prints one line per settled task, JSON mode prints every
//! event as a JSON object per line, quiet mode prints only the summary.

use crate::executor::SessionEvent;
use crate::session::{Session, SessionStatus, TaskStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

pub trait OutputHandler: Send + Sync {
    fn emit(&self, event: &SessionEvent);

    /// Final report once the session has finished
    fn summary(&self, session: &Session);
}

/// Human-readable lines on stderr, summary on stdout
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_event(&self, event: &SessionEvent) -> Option<String> {
        match event {
            SessionEvent::SessionStarted {
                session_id,
                workflow,
                attempt,
                tasks,
            } => Some(format!(
                "Session {} started: workflow '{}' attempt {} ({} tasks)",
                session_id, workflow, attempt, tasks
            )),
            SessionEvent::TaskDispatched {
                task,
                lock_id,
                attempt,
                ..
            } if self.debug => Some(format!("  -> {} (attempt {}, lock {})", task, attempt, lock_id)),
            SessionEvent::TaskDispatched { .. } => None,
            SessionEvent::TaskFinished {
                task,
                status,
                error,
                ..
            } => {
                let mark = match status {
                    TaskStatus::Success => "✓",
                    TaskStatus::RetryWaiting => "↻",
                    _ => "✗",
                };
                Some(match error {
                    Some(error) => format!("  {} {} [{}]: {}", mark, task, status, error),
                    None => format!("  {} {} [{}]", mark, task, status),
                })
            }
            SessionEvent::SessionFinished { session_id, status } => {
                Some(format!("Session {} finished: {}", session_id, status))
            }
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: &SessionEvent) {
        if let Some(line) = self.format_event(event) {
            eprintln!("{}", line);
        }
    }

    fn summary(&self, session: &Session) {
        println!("{}", format_summary(session));
    }
}

/// One JSON object per event on stdout
pub struct JsonHandler;

impl JsonHandler {
    fn print_json<T: Serialize>(value: &T) {
        if let Ok(s) = serde_json::to_string(value) {
            println!("{}", s);
        }
    }
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session_id: &'a str,
    status: SessionStatus,
    attempt: u32,
    tasks: Vec<(TaskStatus, usize)>,
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: &SessionEvent) {
        Self::print_json(event);
    }

    fn summary(&self, session: &Session) {
        Self::print_json(&SummaryRecord {
            kind: "Summary",
            session_id: session.id.as_str(),
            status: session.status,
            attempt: session.attempt,
            tasks: session.status_counts(),
        });
    }
}

pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: &SessionEvent) {}

    fn summary(&self, session: &Session) {
        println!("{}", session.status);
    }
}

pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

fn format_summary(session: &Session) -> String {
    let counts = session
        .status_counts()
        .into_iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} attempt {}: {} ({})",
        session.key, session.attempt, session.status, counts
    )
}
