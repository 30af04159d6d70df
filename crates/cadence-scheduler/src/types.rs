use std::collections::BTreeMap;

use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A single scalar in a job payload. Nested arrays and objects are refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for JobValue {
    fn from(v: bool) -> Self {
        JobValue::Bool(v)
    }
}

impl From<i64> for JobValue {
    fn from(v: i64) -> Self {
        JobValue::Int(v)
    }
}

impl From<f64> for JobValue {
    fn from(v: f64) -> Self {
        JobValue::Float(v)
    }
}

impl From<&str> for JobValue {
    fn from(v: &str) -> Self {
        JobValue::Text(v.to_string())
    }
}

impl From<String> for JobValue {
    fn from(v: String) -> Self {
        JobValue::Text(v)
    }
}

/// Opaque payload handed verbatim to the worker.
pub type JobData = BTreeMap<String, JobValue>;

/// Fields shared by one-off and recurring jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBase {
    /// `None` until the job has been saved.
    pub id: Option<i64>,
    pub worker_name: String,
    #[serde(default)]
    pub job_data: JobData,
    /// When the job was last handed off. `None` means still pending.
    pub time_executed: Option<DateTime<Utc>>,
}

impl JobBase {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            id: None,
            worker_name: worker_name.into(),
            job_data: JobData::new(),
            time_executed: None,
        }
    }
}

/// One pending unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    #[serde(flatten)]
    pub base: JobBase,
    /// Earliest instant the job may be dispatched.
    pub execute_time: DateTime<Utc>,
    /// Recurring job this instance was expanded from.
    pub recurrence_id: Option<i64>,
}

impl ScheduledJob {
    pub fn new(worker_name: impl Into<String>, execute_time: DateTime<Utc>) -> Self {
        Self {
            base: JobBase::new(worker_name),
            execute_time,
            recurrence_id: None,
        }
    }

    pub fn with_data(mut self, job_data: JobData) -> Self {
        self.base.job_data = job_data;
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.base.id
    }

    pub fn worker_name(&self) -> &str {
        &self.base.worker_name
    }

    pub fn job_data(&self) -> &JobData {
        &self.base.job_data
    }

    pub fn time_executed(&self) -> Option<DateTime<Utc>> {
        self.base.time_executed
    }

    pub fn is_pending(&self) -> bool {
        self.base.time_executed.is_none()
    }
}

/// Unit of a [`RecurringJob`] interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl std::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntervalUnit::Second => "second",
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "second" => Ok(IntervalUnit::Second),
            "minute" => Ok(IntervalUnit::Minute),
            "hour" => Ok(IntervalUnit::Hour),
            "day" => Ok(IntervalUnit::Day),
            "week" => Ok(IntervalUnit::Week),
            "month" => Ok(IntervalUnit::Month),
            other => Err(SchedulerError::UnsupportedUnit(other.to_string())),
        }
    }
}

/// A job definition that fires every `interval` × `interval_unit`.
///
/// Recurring jobs are never dispatched directly; the expansion step turns
/// each due definition into a [`ScheduledJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    #[serde(flatten)]
    pub base: JobBase,
    pub interval_unit: IntervalUnit,
    pub interval: u32,
}

impl RecurringJob {
    pub fn new(worker_name: impl Into<String>, interval_unit: IntervalUnit, interval: u32) -> Self {
        Self {
            base: JobBase::new(worker_name),
            interval_unit,
            interval,
        }
    }

    pub fn with_data(mut self, job_data: JobData) -> Self {
        self.base.job_data = job_data;
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.base.id
    }

    /// When the next instance becomes due.
    ///
    /// A job that never ran is due a year before `now` so it fires at once.
    /// Months are added on the calendar (Jan 31 + 1 month = Feb 28/29), the
    /// other units as exact durations.
    pub fn next_execute_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.interval == 0 {
            return Err(SchedulerError::InvalidArgument(
                "recurring job interval must be at least 1".to_string(),
            ));
        }

        let Some(last) = self.base.time_executed else {
            return now
                .checked_sub_months(Months::new(12))
                .ok_or_else(|| SchedulerError::TimeOverflow(format!("{now} - 1 year")));
        };

        let n = self.interval;
        let next = match self.interval_unit {
            IntervalUnit::Second => add_seconds(last, i64::from(n)),
            IntervalUnit::Minute => add_seconds(last, i64::from(n) * 60),
            IntervalUnit::Hour => add_seconds(last, i64::from(n) * 3_600),
            IntervalUnit::Day => last.checked_add_days(Days::new(u64::from(n))),
            IntervalUnit::Week => last.checked_add_days(Days::new(u64::from(n) * 7)),
            IntervalUnit::Month => last.checked_add_months(Months::new(n)),
        };
        next.ok_or_else(|| {
            SchedulerError::TimeOverflow(format!("{last} + {n} {}", self.interval_unit))
        })
    }
}

fn add_seconds(at: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(secs).and_then(|delta| at.checked_add_signed(delta))
}
