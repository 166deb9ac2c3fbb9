//! flowd: a workflow orchestration engine
//!
//! Workflow definitions are compiled into immutable task graphs
//! ([`compiler`]), executed as sessions ([`session`], [`executor`]) whose
//! operator tasks are handed to agents through a task queue ([`queue`]).
//! Sessions and schedules persist in a [`store`]; the [`trigger`] starts
//! sessions for due schedule slots.

pub mod agent;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod logging;
pub mod queue;
pub mod session;
pub mod store;
pub mod template;
pub mod trigger;
