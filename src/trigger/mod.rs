//! Recurring session triggers, driven by `flowd serve`

mod runner;
mod schedule;

pub use runner::{ScheduleTrigger, TriggerReport};
pub use schedule::{RecurrenceRule, ScheduleEntry};
