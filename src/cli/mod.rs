//! Command-line surface of flowd
//!
//! - `check`: compile a workflow file and print its task tree
//! - `run`: execute one session locally with in-process agents
//! - `serve`: fire the schedules of a project tree until interrupted

pub mod commands;
pub mod output;
pub mod serve;
pub mod signals;

pub use commands::{RunArgs, check_workflow, parse_params, run_workflow};
pub use output::{OutputHandler, OutputMode, create_handler};
pub use serve::{ServeArgs, serve};
pub use signals::{CancellationToken, setup_signal_handlers, with_cancellation};
