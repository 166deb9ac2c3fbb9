//! Template engine for task configuration
//!
//! Config strings are Jinja2-compatible templates resolved just before a task
//! is dispatched. The compiler uses the same engine to find out which
//! variables a template reads, so bad references fail at compile time.
//!
//! # Namespaces
//!
//! - `vars.<name>`: declared workflow variables and session params
//! - `tasks.<name>.<key>`: output of an upstream task
//! - `session.{id,time,date,attempt,workflow,project}`
//!
//! # Example
//!
//! ```ignore
//! use flowd::template::{TemplateEngine, TemplateContext};
//!
//! let engine = TemplateEngine::new();
//! let mut ctx = TemplateContext::new();
//! ctx.add_task_output("extract", ConfigMap::new().with("rows", 42i64));
//!
//! let cmd = engine.render("load --rows {{ tasks.extract.rows }}", &ctx)?;
//! ```

mod context;
mod engine;
mod errors;
mod filters;

pub use context::{NAMESPACES, SESSION_FIELDS, SessionInfo, TemplateContext};
pub use engine::{Reference, TemplateEngine};
pub use errors::{TemplateError, suggest_correction};
