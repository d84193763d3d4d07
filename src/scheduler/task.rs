//! Scheduled task definitions.
//!
//! Defines the [`Task`] record, its [`Occurrence`] policy and the
//! [`Schedule`] used to compute the next run. All times are UTC and
//! schedule-derived run times are minute-aligned.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;

/// Upper bound on search steps for a time-based schedule. Any valid field
/// combination matches within one week of hour/day jumps and minute steps.
const MAX_SCHEDULE_STEPS: usize = 8 * 24 + 60 + 8;

/// Unique task identifier, assigned by the scheduler on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Placeholder id carried by tasks that have not been registered yet.
    pub const UNASSIGNED: Self = Self(Uuid::nil());

    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns `true` for the [`TaskId::UNASSIGNED`] placeholder.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Firing policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occurrence {
    /// Fire once, then drop the task.
    Once,
    /// Fire repeatedly according to the schedule.
    Repeat,
    /// Fire every time the scheduler starts up.
    EveryStartup,
    /// Fire every time the system resumes from suspend.
    EveryWakeUp,
}

impl std::fmt::Display for Occurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Once => "once",
            Self::Repeat => "repeat",
            Self::EveryStartup => "every startup",
            Self::EveryWakeUp => "every wake-up",
        };
        f.write_str(label)
    }
}

/// How the next run of a task is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run at the caller-provided `next_run`; has no recurrence.
    Fixed,
    /// Run every N seconds.
    Interval {
        /// Interval in seconds between runs.
        secs: u64,
    },
    /// Run at every minute matching all set fields (UTC). `None` matches
    /// any value, so `{ minute: Some(30), hour: None, weekday: None }` runs
    /// at half past every hour.
    TimeBased {
        /// Minute of hour (0-59).
        #[serde(default)]
        minute: Option<u8>,
        /// Hour of day (0-23).
        #[serde(default)]
        hour: Option<u8>,
        /// Day of week.
        #[serde(default)]
        weekday: Option<Weekday>,
    },
}

impl Schedule {
    /// Shorthand for an interval schedule.
    #[must_use]
    pub fn every(interval: std::time::Duration) -> Self {
        Self::Interval {
            secs: interval.as_secs(),
        }
    }

    /// Shorthand for a daily time-based schedule.
    #[must_use]
    pub fn daily_at(hour: u8, minute: u8) -> Self {
        Self::TimeBased {
            minute: Some(minute),
            hour: Some(hour),
            weekday: None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Fixed => Ok(()),
            Self::Interval { secs } if *secs == 0 => {
                Err("interval schedule must be positive".to_owned())
            }
            Self::Interval { secs } if i64::try_from(*secs).is_err() => {
                Err(format!("interval of {secs}s is out of range"))
            }
            Self::Interval { .. } => Ok(()),
            Self::TimeBased { minute, hour, .. } => {
                if minute.is_some_and(|m| m > 59) {
                    return Err("minute must be between 0 and 59".to_owned());
                }
                if hour.is_some_and(|h| h > 23) {
                    return Err("hour must be between 0 and 23".to_owned());
                }
                Ok(())
            }
        }
    }

    /// First run for a freshly created task.
    fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Fixed => now,
            Self::Interval { secs } => add_secs(floor_minute(now), *secs),
            Self::TimeBased { .. } => self.next_matching_after(now),
        }
    }

    /// First minute strictly after `after` matching every set field.
    fn next_matching_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let Self::TimeBased {
            minute,
            hour,
            weekday,
        } = self
        else {
            return DateTime::<Utc>::MAX_UTC;
        };

        let mut candidate = add_secs(floor_minute(after), 60);
        for _ in 0..MAX_SCHEDULE_STEPS {
            if weekday.is_some_and(|day| candidate.weekday() != day) {
                candidate = add_secs(floor_to(candidate, SECS_PER_DAY), 86_400);
                continue;
            }
            if hour.is_some_and(|h| candidate.hour() != u32::from(h)) {
                candidate = add_secs(floor_to(candidate, SECS_PER_HOUR), 3_600);
                continue;
            }
            if let Some(m) = minute {
                let current = candidate.minute();
                let target = u32::from(*m);
                if current != target {
                    if current < target {
                        candidate = add_secs(candidate, u64::from(target - current) * 60);
                    } else {
                        candidate = add_secs(floor_to(candidate, SECS_PER_HOUR), 3_600);
                    }
                    continue;
                }
            }
            return candidate;
        }

        DateTime::<Utc>::MAX_UTC
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => f.write_str("fixed time"),
            Self::Interval { secs } => {
                if *secs >= 3600 && secs % 3600 == 0 {
                    write!(f, "every {} hours", secs / 3600)
                } else if *secs >= 60 && secs % 60 == 0 {
                    write!(f, "every {} minutes", secs / 60)
                } else {
                    write!(f, "every {secs} seconds")
                }
            }
            Self::TimeBased {
                minute,
                hour,
                weekday,
            } => {
                let field = |v: &Option<u8>| v.map_or_else(|| "*".to_owned(), |v| format!("{v:02}"));
                write!(f, "at {}:{} UTC", field(hour), field(minute))?;
                match weekday {
                    Some(day) => write!(f, " on {day}"),
                    None => f.write_str(" every day"),
                }
            }
        }
    }
}

/// A schedulable unit of deferred or recurring work.
///
/// `Task` is a plain value: cloning yields an independent snapshot, which is
/// what the scheduler hands out to callers and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier; [`TaskId::UNASSIGNED`] until registered.
    pub id: TaskId,
    /// Subsystem that registered the task.
    pub owner: String,
    /// Firing policy.
    pub occurrence: Occurrence,
    /// Recurrence definition.
    pub schedule: Schedule,
    /// Next scheduled firing; the sort key inside a collection.
    pub next_run: DateTime<Utc>,
    /// Previous firing, if any.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Hard expiry; the task is dropped once reached.
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Fire once even when the scheduled time was missed.
    #[serde(default)]
    pub force_run: bool,
    /// Candidate for arming the wake timer on suspend.
    #[serde(default)]
    pub wakeup_system: bool,
}

impl Task {
    /// Create an unregistered task whose first run is derived from `schedule`.
    pub fn new(owner: impl Into<String>, occurrence: Occurrence, schedule: Schedule) -> Self {
        Self::new_at(owner, occurrence, schedule, Utc::now())
    }

    /// Like [`Task::new`] with an explicit reference time.
    pub fn new_at(
        owner: impl Into<String>,
        occurrence: Occurrence,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        let next_run = match occurrence {
            Occurrence::Once | Occurrence::Repeat => schedule.first_run(now),
            Occurrence::EveryStartup | Occurrence::EveryWakeUp => DateTime::<Utc>::MAX_UTC,
        };
        Self {
            id: TaskId::UNASSIGNED,
            owner: owner.into(),
            occurrence,
            schedule,
            next_run,
            last_run: None,
            expires: None,
            force_run: false,
            wakeup_system: false,
        }
    }

    /// A one-shot task firing at `at`.
    pub fn once_at(owner: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(owner, Occurrence::Once, Schedule::Fixed).with_next_run(at)
    }

    /// A repeating task firing every `interval`.
    pub fn repeating(owner: impl Into<String>, interval: std::time::Duration) -> Self {
        Self::new(owner, Occurrence::Repeat, Schedule::every(interval))
    }

    /// Override the next run.
    #[must_use]
    pub fn with_next_run(mut self, next_run: DateTime<Utc>) -> Self {
        self.next_run = next_run;
        self
    }

    /// Set a hard expiry.
    #[must_use]
    pub fn with_expiration(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Fire even when the scheduled time was missed.
    #[must_use]
    pub fn with_force_run(mut self, force_run: bool) -> Self {
        self.force_run = force_run;
        self
    }

    /// Allow this task to wake the system from suspend.
    #[must_use]
    pub fn with_wakeup_system(mut self, wakeup_system: bool) -> Self {
        self.wakeup_system = wakeup_system;
        self
    }

    /// Check the definition before it enters a collection.
    pub fn validate(&self) -> Result<()> {
        self.schedule
            .validate()
            .map_err(SchedulerError::InvalidTask)?;
        if self.occurrence == Occurrence::Repeat && self.schedule == Schedule::Fixed {
            return Err(SchedulerError::InvalidTask(
                "a repeating task needs an interval or time-based schedule".to_owned(),
            ));
        }
        Ok(())
    }

    /// `true` once the minute containing `now` has reached `next_run`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        floor_minute(now) >= self.next_run
    }

    /// `true` when the run is overdue by more than `tolerance`, i.e. the
    /// scheduler was not running at the scheduled time.
    #[must_use]
    pub fn is_missed(&self, now: DateTime<Utc>, tolerance: TimeDelta) -> bool {
        floor_minute(now).signed_duration_since(self.next_run) > tolerance
    }

    /// `true` when an expiry is set and has been reached.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| now >= expires)
    }

    /// Record a firing: `last_run` takes the scheduled time and a repeating
    /// task moves strictly past `now`. Startup and wake-up tasks have no
    /// scheduled time, so they record `now`.
    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        match self.occurrence {
            Occurrence::Once => self.last_run = Some(self.next_run),
            Occurrence::Repeat => {
                self.last_run = Some(self.next_run);
                self.next_run = self.next_run_after(now);
            }
            Occurrence::EveryStartup | Occurrence::EveryWakeUp => self.last_run = Some(now),
        }
    }

    /// Move a repeating task past `now` without recording a run.
    pub fn skip_to_next(&mut self, now: DateTime<Utc>) {
        if self.occurrence == Occurrence::Repeat {
            self.next_run = self.next_run_after(now);
        }
    }

    /// Next run on this task's cadence that lies strictly after `now`.
    /// Interval tasks stay anchored on whole multiples of the interval.
    fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match &self.schedule {
            Schedule::Fixed => self.next_run,
            Schedule::Interval { secs } => {
                let step = i64::try_from(*secs).unwrap_or(i64::MAX).max(1);
                let behind = now.signed_duration_since(self.next_run).num_seconds().max(0);
                let steps = behind / step + 1;
                TimeDelta::try_seconds(steps.saturating_mul(step))
                    .and_then(|delta| self.next_run.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Schedule::TimeBased { .. } => {
                let reference = self.next_run.max(now);
                self.schedule.next_matching_after(reference)
            }
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} (owner {}): {}, {}, next {}",
            self.id, self.owner, self.occurrence, self.schedule, self.next_run
        )?;
        if let Some(last) = self.last_run {
            write!(f, ", last {last}")?;
        }
        if let Some(expires) = self.expires {
            write!(f, ", expires {expires}")?;
        }
        if self.wakeup_system {
            f.write_str(", wakeup")?;
        }
        if self.force_run {
            f.write_str(", force")?;
        }
        Ok(())
    }
}

/// Truncate `time` to the start of its minute.
#[must_use]
pub fn floor_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(time, SECS_PER_MINUTE)
}

fn floor_to(time: DateTime<Utc>, unit_secs: i64) -> DateTime<Utc> {
    let ts = time.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(unit_secs), 0).unwrap_or(time)
}

fn add_secs(time: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
