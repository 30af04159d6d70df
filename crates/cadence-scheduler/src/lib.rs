//! `cadence-scheduler` — SQLite-backed job scheduling with claim-once dispatch.
//!
//! # Overview
//!
//! One-off work is stored as [`ScheduledJob`] rows in `worker_scheduled_jobs`.
//! Recurring definitions ([`RecurringJob`]) live in `worker_recurring_jobs` and
//! are expanded into scheduled rows by [`SchedulerService::expand_recurring_jobs`].
//!
//! The [`SchedulerEngine`] walks the due backlog with a [`DueJobCursor`]:
//!
//! 1. fetch up to `batch_size` pending jobs with `execute_time <= now`,
//! 2. claim each one with a conditional update (`ts_executed IS NULL`),
//! 3. hand the winners to a [`WorkerDispatcher`],
//! 4. release the claim if the hand-off is refused.
//!
//! A claim that affects zero rows means another poller got there first, so
//! several engines may share one database file.

pub mod db;
pub mod engine;
pub mod error;
pub mod service;
pub mod store;
pub mod types;

pub use engine::{ChannelDispatcher, SchedulerEngine, TickReport, WorkerDispatcher};
pub use error::{DispatchError, Result, SchedulerError};
pub use service::SchedulerService;
pub use store::{DueJobCursor, SchedulerStore, SqliteSchedulerStore};
pub use types::{IntervalUnit, JobBase, JobData, JobValue, RecurringJob, ScheduledJob};
