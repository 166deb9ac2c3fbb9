//! Workflow compiler
//!
//! Flattens a [`WorkflowDefinition`](crate::config::WorkflowDefinition) tree
//! into a [`CompiledTaskGraph`]: an arena of nodes indexed in pre-order, with
//! parents, children, upstream outputs and error handlers resolved up front.
//! Everything that can be checked without running a task is checked here.
//!
//! # Example
//!
//! ```ignore
//! use flowd::compiler::Compiler;
//! use flowd::config::load_workflow;
//!
//! let def = load_workflow(Path::new("etl.toml"))?;
//! let graph = Compiler::default().compile(&def)?;
//! print!("{}", graph.render_tree());
//! ```

mod compile;
mod error;
mod graph;

pub use compile::{Compiler, OperatorRegistry};
pub use error::CompileError;
pub use graph::{CompiledTaskGraph, TaskNode};
