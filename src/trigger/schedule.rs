//! Schedule entries and recurrence rules

use crate::session::SessionId;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// When a schedule fires, evaluated in UTC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// Every hour at `minute`
    Hourly { minute: u32 },
    /// Every day at `at`
    Daily {
        #[serde(with = "time_of_day")]
        at: NaiveTime,
    },
    Weekly {
        weekday: Weekday,
        #[serde(with = "time_of_day")]
        at: NaiveTime,
    },
    /// Every `minutes`, aligned to the Unix epoch
    Interval { minutes: u32 },
}

impl RecurrenceRule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Hourly { minute } if *minute >= 60 => {
                Err(format!("hourly minute must be below 60, got {}", minute))
            }
            Self::Interval { minutes: 0 } => Err("interval must be at least one minute".into()),
            _ => Ok(()),
        }
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hourly { minute } => {
                let hour = after
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(after);
                let candidate = hour + Duration::minutes(i64::from((*minute).min(59)));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Self::Daily { at } => {
                let candidate = at_time(after, *at);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Self::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - after.weekday().num_days_from_monday())
                    % 7;
                let candidate = at_time(after, *at) + Duration::days(i64::from(ahead));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::weeks(1)
                }
            }
            Self::Interval { minutes } => {
                let step = i64::from((*minutes).max(1)) * 60;
                let slot = after.timestamp().div_euclid(step) + 1;
                Utc.timestamp_opt(slot * step, 0)
                    .single()
                    .unwrap_or(after + Duration::seconds(step))
            }
        }
    }
}

fn at_time(day: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.date_naive().and_time(time))
}

/// `HH:MM` or `HH:MM:SS`
mod time_of_day {
    use chrono::{NaiveTime, Timelike};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        let text = if time.second() == 0 {
            time.format("%H:%M").to_string()
        } else {
            time.format("%H:%M:%S").to_string()
        };
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(d)?;
        NaiveTime::parse_from_str(&text, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M"))
            .map_err(|_| D::Error::custom(format!("invalid time of day '{}'", text)))
    }
}

/// A workflow fired on a recurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub project: String,
    pub workflow: String,
    pub rule: RecurrenceRule,
    /// Logical time of the next slot to fire
    pub next_run_time: DateTime<Utc>,
    pub last_session: Option<SessionId>,
    pub last_session_time: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// New entry whose first slot is the first fire time after `now`
    pub fn new(
        project: impl Into<String>,
        workflow: impl Into<String>,
        rule: RecurrenceRule,
        now: DateTime<Utc>,
    ) -> Self {
        let next_run_time = rule.next_after(now);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.into(),
            workflow: workflow.into(),
            rule,
            next_run_time,
            last_session: None,
            last_session_time: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_time <= now
    }

    /// Move past the slot at `next_run_time`
    pub fn advance(&mut self) {
        self.next_run_time = self.rule.next_after(self.next_run_time);
    }
}
