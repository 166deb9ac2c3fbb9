//! Template context for config resolution

use crate::config::ConfigMap;
use chrono::{DateTime, Utc};
use minijinja::value::{Enumerator, Object, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Top-level names a config template may reference
pub const NAMESPACES: &[&str] = &["vars", "tasks", "session"];

/// Built-in `session.*` attributes
pub const SESSION_FIELDS: &[&str] = &["id", "time", "date", "attempt", "workflow", "project"];

/// Identity of the session a task runs in
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionInfo {
    pub id: String,
    /// Logical session time, RFC 3339
    pub time: String,
    /// Logical session date, `YYYY-MM-DD`
    pub date: String,
    pub attempt: u32,
    pub workflow: String,
    pub project: String,
}

impl SessionInfo {
    pub fn new(
        id: impl Into<String>,
        session_time: DateTime<Utc>,
        attempt: u32,
        workflow: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            time: session_time.to_rfc3339(),
            date: session_time.format("%Y-%m-%d").to_string(),
            attempt,
            workflow: workflow.into(),
            project: project.into(),
        }
    }
}

/// Values visible to a task's config templates
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Declared workflow variables, overridden by session params
    pub vars: ConfigMap,

    /// Outputs of upstream tasks, keyed by task name
    pub tasks: BTreeMap<String, ConfigMap>,

    pub session: SessionInfo,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: ConfigMap) -> Self {
        Self {
            vars,
            ..Default::default()
        }
    }

    /// Expose an upstream task's output under `tasks.<name>`
    ///
    /// Later calls shadow earlier ones, so callers add upstream outputs
    /// farthest first.
    pub fn add_task_output(&mut self, name: impl Into<String>, output: ConfigMap) {
        self.tasks.insert(name.into(), output);
    }

    pub fn set_session(&mut self, session: SessionInfo) {
        self.session = session;
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        Value::from_object(ContextObject(self.clone()))
    }

    /// Known names for error suggestions
    pub fn known_variables(&self) -> Vec<&str> {
        let mut known: Vec<&str> = NAMESPACES.to_vec();
        known.extend(self.vars.keys().map(|k| k.as_str()));
        known.extend(self.tasks.keys().map(|k| k.as_str()));
        known
    }
}

#[derive(Debug, Clone)]
struct ContextObject(TemplateContext);

impl fmt::Display for ContextObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemplateContext")
    }
}

impl Object for ContextObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "vars" => Some(Value::from_serialize(&self.0.vars)),
            "tasks" => Some(Value::from_serialize(&self.0.tasks)),
            "session" => Some(Value::from_serialize(&self.0.session)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(NAMESPACES)
    }
}
