use std::sync::Arc;

use cadence_recurrence::RecurrencePattern;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    store::SchedulerStore,
    types::{IntervalUnit, JobBase, JobData, RecurringJob, ScheduledJob},
};

/// Most one-off jobs a single [`SchedulerService::schedule_pattern`] call may create.
pub const MAX_SERIES_INSTANCES: usize = 10_000;

/// Application-facing entry point: schedule work, expand recurring jobs,
/// inspect the backlog.
#[derive(Clone)]
pub struct SchedulerService {
    store: Arc<dyn SchedulerStore>,
}

impl SchedulerService {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn SchedulerStore {
        self.store.as_ref()
    }

    /// Shared handle for work that outlives a borrow, such as a blocking task.
    pub fn store_handle(&self) -> Arc<dyn SchedulerStore> {
        Arc::clone(&self.store)
    }

    /// Run `worker_name` once at `execute_time`.
    pub fn schedule_at_time(
        &self,
        worker_name: &str,
        execute_time: DateTime<Utc>,
        job_data: JobData,
    ) -> Result<i64> {
        let job = ScheduledJob::new(worker_name, execute_time).with_data(job_data);
        let id = self.store.save_scheduled_job(&job)?;
        info!(job_id = id, worker = %worker_name, execute_time = %execute_time, "job scheduled");
        Ok(id)
    }

    /// Run `worker_name` every `interval` × `unit`, starting on the next expansion.
    pub fn schedule_at_interval(
        &self,
        worker_name: &str,
        job_data: JobData,
        unit: IntervalUnit,
        interval: u32,
    ) -> Result<i64> {
        if interval == 0 {
            return Err(SchedulerError::InvalidArgument(
                "interval must be at least 1".to_string(),
            ));
        }
        let job = RecurringJob::new(worker_name, unit, interval).with_data(job_data);
        let id = self.store.save_recurring_job(&job)?;
        info!(recurring_id = id, worker = %worker_name, interval, %unit, "recurring job scheduled");
        Ok(id)
    }

    /// Lay out a calendar series as one-off jobs, one per occurrence up to
    /// and including `until`. Occurrences are read as UTC wall-clock times.
    ///
    /// Nothing is written if the pattern is invalid or the series would
    /// exceed [`MAX_SERIES_INSTANCES`]. Returns the new job ids in order.
    pub fn schedule_pattern(
        &self,
        worker_name: &str,
        job_data: JobData,
        pattern: &RecurrencePattern,
        until: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        pattern.validate()?;
        let until = until.naive_utc();

        let mut dates = Vec::new();
        for occurrence in pattern.occurrences() {
            let date = occurrence?;
            if date > until {
                break;
            }
            if dates.len() == MAX_SERIES_INSTANCES {
                return Err(SchedulerError::InvalidArgument(format!(
                    "series yields more than {MAX_SERIES_INSTANCES} jobs before {until}"
                )));
            }
            dates.push(date);
        }

        let mut ids = Vec::with_capacity(dates.len());
        for date in dates {
            let job = ScheduledJob::new(worker_name, date.and_utc()).with_data(job_data.clone());
            ids.push(self.store.save_scheduled_job(&job)?);
        }
        info!(
            worker = %worker_name,
            recur_type = ?pattern.recur_type,
            count = ids.len(),
            "series scheduled"
        );
        Ok(ids)
    }

    /// Turn every recurring job due by `to_date` into a scheduled job.
    ///
    /// A job that never ran gets an instance at `to_date`; otherwise the
    /// instance is placed at its computed next execute time. Each recurring
    /// job then records `to_date` as its last expansion. Returns the number of
    /// instances created.
    pub fn expand_recurring_jobs(&self, to_date: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;
        for job in self.store.get_all_recurring_jobs()? {
            match self.expand_one(&job, to_date) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) if e.is_recoverable() => return Err(e),
                Err(e) => {
                    warn!(recurring_id = ?job.id(), code = e.code(), "skipping recurring job: {e}");
                }
            }
        }
        if created > 0 {
            info!(count = created, to_date = %to_date, "recurring jobs expanded");
        }
        Ok(created)
    }

    fn expand_one(&self, job: &RecurringJob, to_date: DateTime<Utc>) -> Result<bool> {
        let id = job
            .id()
            .ok_or_else(|| SchedulerError::InvalidArgument("recurring job has no id".to_string()))?;
        let previous = job.base.time_executed;
        if previous.is_some_and(|last| last >= to_date) {
            return Ok(false);
        }

        let next = job.next_execute_time(to_date)?;
        if next > to_date {
            return Ok(false);
        }

        let instance = ScheduledJob {
            base: JobBase {
                id: None,
                worker_name: job.base.worker_name.clone(),
                job_data: job.base.job_data.clone(),
                time_executed: None,
            },
            execute_time: if previous.is_none() { to_date } else { next },
            recurrence_id: Some(id),
        };

        match self.store.advance_recurring_job(id, previous, to_date, &instance)? {
            Some(job_id) => {
                debug!(recurring_id = id, job_id, "recurring instance created");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read-only view of what is due. Does not claim anything.
    pub fn due_jobs(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        self.store.get_due_jobs(as_of, limit)
    }

    /// Mark `job` executed by `claimant`. `false` means someone else already did.
    pub fn set_job_as_executed(&self, job: &ScheduledJob, claimant: &str) -> Result<bool> {
        let id = job.id().ok_or_else(|| {
            SchedulerError::InvalidArgument("cannot mark a job without an id as executed".to_string())
        })?;
        self.store.claim_job(id, claimant, Utc::now())
    }
}
