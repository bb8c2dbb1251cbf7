//! Schedule specifications and the trigger that turns them into fire instants.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::CronError;

const DAY_OF_WEEK_HINT: &str =
    "Please use a literal day of week (Mon, Tue, Wed, Thu, Fri, Sat, Sun) or *";

/// How often a job fires. Immutable once attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Five-field crontab expression: `minute hour day-of-month month day-of-week`.
    ///
    /// Day-of-week only accepts names (`Mon`..`Sun`, ranges and lists of them) or `*`.
    /// Numeric days are rejected because their first day of the week is ambiguous.
    Cron { expr: String },
    /// Fire every N seconds (minimum 1).
    Interval { interval_sec: u64 },
}

impl ScheduleSpec {
    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron { expr: expr.into() }
    }

    pub fn every(interval_sec: u64) -> Self {
        Self::Interval { interval_sec }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron { expr } => write!(f, "cron '{expr}'"),
            Self::Interval { interval_sec } => write!(f, "every {interval_sec}s"),
        }
    }
}

#[derive(Debug, Clone)]
enum TriggerKind {
    Cron(Box<cron::Schedule>),
    Interval(chrono::Duration),
}

/// A validated [`ScheduleSpec`] bound to the timezone cron fields are read in.
#[derive(Debug, Clone)]
pub struct Trigger {
    kind: TriggerKind,
    tz: Tz,
}

impl Trigger {
    pub fn new(spec: &ScheduleSpec, tz: Tz) -> Result<Self, CronError> {
        let kind = match spec {
            ScheduleSpec::Cron { expr } => TriggerKind::Cron(Box::new(parse_crontab(expr)?)),
            ScheduleSpec::Interval { interval_sec } => {
                if *interval_sec == 0 {
                    return Err(CronError::InvalidSchedule {
                        expr: spec.to_string(),
                        reason: "interval_sec must be >= 1".into(),
                    });
                }
                let secs = i64::try_from(*interval_sec).map_err(|_| CronError::InvalidSchedule {
                    expr: spec.to_string(),
                    reason: "interval_sec is too large".into(),
                })?;
                let interval =
                    chrono::Duration::try_seconds(secs).ok_or_else(|| CronError::InvalidSchedule {
                        expr: spec.to_string(),
                        reason: "interval_sec is too large".into(),
                    })?;
                TriggerKind::Interval(interval)
            }
        };
        Ok(Self { kind, tz })
    }

    /// Next fire instant strictly after `after`, or `None` when the schedule is exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            TriggerKind::Interval(interval) => after.checked_add_signed(*interval),
            TriggerKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// Like [`next_fire`](Self::next_fire), but interval triggers stay on the grid
    /// `anchor + k * interval` (k >= 1): the result is the first grid point strictly
    /// after `after`. Cron triggers ignore `anchor`.
    pub fn next_fire_from(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match &self.kind {
            TriggerKind::Interval(interval) => {
                let step = interval.num_milliseconds();
                let elapsed = after.signed_duration_since(anchor).num_milliseconds();
                let steps = (elapsed.div_euclid(step) + 1).max(1);
                let offset = chrono::Duration::try_milliseconds(step.checked_mul(steps)?)?;
                anchor.checked_add_signed(offset)
            }
            TriggerKind::Cron(_) => self.next_fire(after),
        }
    }
}

/// Parse a five-field crontab line into a seconds-resolution `cron::Schedule`.
fn parse_crontab(expr: &str) -> Result<cron::Schedule, CronError> {
    let invalid = |reason: String| CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason,
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
        return Err(invalid(format!(
            "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
            fields.len()
        )));
    };

    let day_of_week = literal_day_of_week(day_of_week).ok_or_else(|| invalid(DAY_OF_WEEK_HINT.into()))?;

    let line = format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}");
    cron::Schedule::from_str(&line).map_err(|e| invalid(e.to_string()))
}

/// Title-case day names (`mon` -> `Mon`); `None` if the field contains a digit.
fn literal_day_of_week(field: &str) -> Option<String> {
    if field.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut word_start = true;
    for c in field.chars() {
        if c.is_ascii_alphabetic() {
            out.push(if word_start {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            });
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    Some(out)
}
