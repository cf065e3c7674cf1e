//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Longest accepted interval: a leap year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 86_400;

/// When a timer entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cadence {
    /// Every N seconds from the previous fire.
    Interval { seconds: u64 },
    /// Every day at a UTC time of day.
    Daily { at: NaiveTime },
    /// Every week on a weekday at a UTC time of day.
    Weekly { weekday: Weekday, at: NaiveTime },
}

impl Cadence {
    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Interval { seconds } => {
                after + Duration::seconds(seconds.min(MAX_INTERVAL_SECS) as i64)
            }
            Cadence::Daily { at } => {
                let candidate = after.date_naive().and_time(at).and_utc();
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Cadence::Weekly { weekday, at } => {
                let days_ahead = (weekday.num_days_from_monday() + 7
                    - after.weekday().num_days_from_monday())
                    % 7;
                let candidate = (after.date_naive() + Duration::days(days_ahead as i64))
                    .and_time(at)
                    .and_utc();
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::weeks(1)
                }
            }
        }
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Cadence::Interval { seconds: 0 } => Err(SchedulerError::InvalidCadence(
                "interval must be at least one second".to_string(),
            )),
            Cadence::Interval { seconds } if *seconds > MAX_INTERVAL_SECS => {
                Err(SchedulerError::InvalidCadence(format!(
                    "interval of {}s exceeds {} days",
                    seconds,
                    MAX_INTERVAL_SECS / 86_400
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Parses `30s`, `10m`, `6h`, `2d`, `daily@03:00` and `mon@02:30`.
impl FromStr for Cadence {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || SchedulerError::InvalidCadence(s.to_string());

        if let Some((day, time)) = s.split_once('@') {
            let at = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| invalid())?;
            let cadence = if day.eq_ignore_ascii_case("daily") {
                Cadence::Daily { at }
            } else {
                let weekday = Weekday::from_str(day).map_err(|_| invalid())?;
                Cadence::Weekly { weekday, at }
            };
            return Ok(cadence);
        }

        let unit_at = s.len().checked_sub(1).ok_or_else(invalid)?;
        let (count, unit) = s.split_at(unit_at);
        let count: u64 = count.parse().map_err(|_| invalid())?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };
        let cadence = Cadence::Interval {
            seconds: count.checked_mul(multiplier).ok_or_else(invalid)?,
        };
        cadence.validate()?;
        Ok(cadence)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Interval { seconds } => write!(f, "{}s", seconds),
            Cadence::Daily { at } => write!(f, "daily@{}", at.format("%H:%M")),
            Cadence::Weekly { weekday, at } => write!(f, "{}@{}", weekday, at.format("%H:%M")),
        }
    }
}

/// Escalation state shared by a task's main and retry timers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    /// Main cadence only; the retry timer is paused.
    #[default]
    Idle,
    /// A run failed; the retry timer is active.
    Retrying,
}

/// Which timer fired a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Main,
    Retry,
}

/// Result of one run, as reported back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
    /// The run did not start (another run of the same scope holds the guard).
    Skipped(String),
}

/// One timer of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerEntry {
    pub cadence: Cadence,
    pub next_fire: DateTime<Utc>,
    /// Paused timers keep their cadence but never fire.
    pub paused: bool,
}

impl TimerEntry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_fire <= now
    }
}

/// Registration parameters for a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub main: Cadence,
    pub retry: Option<Cadence>,
    /// Fire the main timer right after registration instead of waiting a full cadence.
    pub run_at_startup: bool,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, main: Cadence) -> Self {
        Self {
            name: name.into(),
            main,
            retry: None,
            run_at_startup: false,
        }
    }

    pub fn with_retry(mut self, retry: Cadence) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn run_at_startup(mut self, enabled: bool) -> Self {
        self.run_at_startup = enabled;
        self
    }
}

/// A registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub main: TimerEntry,
    pub retry: Option<TimerEntry>,
    pub state: EscalationState,
    /// A run started by the scheduler has not reported yet.
    pub running: bool,
    /// When this task last succeeded.
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of consecutive failures (resets on success).
    pub failure_count: u32,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> Result<Self, SchedulerError> {
        spec.main.validate()?;
        if let Some(retry) = &spec.retry {
            retry.validate()?;
        }

        let next_main = if spec.run_at_startup {
            now
        } else {
            spec.main.next_after(now)
        };

        Ok(Self {
            name: spec.name,
            main: TimerEntry {
                cadence: spec.main,
                next_fire: next_main,
                paused: false,
            },
            retry: spec.retry.map(|cadence| TimerEntry {
                cadence,
                next_fire: cadence.next_after(now),
                paused: true,
            }),
            state: EscalationState::Idle,
            running: false,
            last_success: None,
            last_error: None,
            failure_count: 0,
        })
    }

    /// Whether the retry timer is currently armed.
    pub fn retry_active(&self) -> bool {
        self.retry.as_ref().is_some_and(|r| !r.paused)
    }

    /// The timer that should fire now, if any. Main wins when both are due.
    pub fn due_trigger(&self, now: DateTime<Utc>) -> Option<Trigger> {
        if self.running {
            return None;
        }
        if self.main.is_due(now) {
            return Some(Trigger::Main);
        }
        match &self.retry {
            Some(retry) if retry.is_due(now) => Some(Trigger::Retry),
            _ => None,
        }
    }

    /// Mark the task running and move every due timer to its next fire.
    pub(crate) fn start(&mut self, now: DateTime<Utc>) {
        self.running = true;
        if self.main.is_due(now) {
            self.main.next_fire = self.main.cadence.next_after(now);
        }
        if let Some(retry) = self.retry.as_mut()
            && retry.is_due(now)
        {
            retry.next_fire = retry.cadence.next_after(now);
        }
    }

    /// Apply an outcome to the escalation state.
    ///
    /// Success pauses the retry timer, failure resumes it. A skipped run
    /// changes nothing.
    pub fn observe(&mut self, outcome: &TaskOutcome, now: DateTime<Utc>) {
        match outcome {
            TaskOutcome::Succeeded => {
                self.state = EscalationState::Idle;
                self.failure_count = 0;
                self.last_success = Some(now);
                self.last_error = None;
                if let Some(retry) = self.retry.as_mut() {
                    retry.paused = true;
                }
            }
            TaskOutcome::Failed(error) => {
                self.state = EscalationState::Retrying;
                self.failure_count += 1;
                self.last_error = Some(error.clone());
                if let Some(retry) = self.retry.as_mut()
                    && retry.paused
                {
                    retry.paused = false;
                    retry.next_fire = retry.cadence.next_after(now);
                }
            }
            TaskOutcome::Skipped(_) => {}
        }
    }

    /// Earliest time any unpaused timer fires.
    pub fn next_fire(&self) -> DateTime<Utc> {
        match &self.retry {
            Some(retry) if !retry.paused => self.main.next_fire.min(retry.next_fire),
            _ => self.main.next_fire,
        }
    }
}
