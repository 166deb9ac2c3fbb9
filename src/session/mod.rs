//! Sessions and the task state machine
//!
//! A [`Session`] is one execution attempt of a compiled graph. It holds one
//! [`TaskState`] per graph node and is only ever mutated through the
//! transition methods in this module, which enforce
//! [`TaskStatus::can_transition_to`].

mod model;
mod progress;
mod status;

pub use model::{AttemptMode, AttemptOptions, Session, SessionId, SessionKey, TaskState};
pub use status::{SessionStatus, TaskStatus, TransitionError};
