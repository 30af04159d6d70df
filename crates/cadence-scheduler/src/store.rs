use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{IntervalUnit, JobBase, JobData, RecurringJob, ScheduledJob},
};

/// Durable storage for scheduled and recurring jobs.
///
/// All mutation of job rows goes through this trait; nothing caches due-job
/// state between calls.
pub trait SchedulerStore: Send + Sync {
    /// Insert when `job.id` is unset, otherwise overwrite the row with that id.
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<i64>;

    fn get_scheduled_job(&self, id: i64) -> Result<Option<ScheduledJob>>;

    fn delete_scheduled_job(&self, job: &ScheduledJob) -> Result<()>;

    /// Pending jobs with `execute_time <= as_of`, oldest first, at most `limit`.
    ///
    /// Read-only: repeated calls return the same rows until they are claimed.
    /// Use [`DueJobCursor`] to walk the backlog.
    fn get_due_jobs(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>>;

    /// Mark a pending job executed on behalf of `claimant`.
    ///
    /// Returns `false` when the job was already executed or claimed elsewhere.
    fn claim_job(&self, id: i64, claimant: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Undo a claim made by `claimant` at `at`, making the job due again.
    fn release_claim(&self, id: i64, claimant: &str, at: DateTime<Utc>) -> Result<bool>;

    fn save_recurring_job(&self, job: &RecurringJob) -> Result<i64>;

    fn get_recurring_job(&self, id: i64) -> Result<Option<RecurringJob>>;

    fn get_all_recurring_jobs(&self) -> Result<Vec<RecurringJob>>;

    fn delete_recurring_job(&self, job: &RecurringJob) -> Result<()>;

    /// Atomically move a recurring job's `time_executed` from `previous` to
    /// `to_date` and insert `instance`.
    ///
    /// Returns the new scheduled job id, or `None` if another expander moved
    /// the recurring job first (nothing is written in that case).
    fn advance_recurring_job(
        &self,
        recurring_id: i64,
        previous: Option<DateTime<Utc>>,
        to_date: DateTime<Utc>,
        instance: &ScheduledJob,
    ) -> Result<Option<i64>>;
}

/// Storage form of a timestamp: microseconds since the Unix epoch.
///
/// Covers every date chrono can represent, so integer order is
/// chronological order with no width or sign edge cases.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// [`SchedulerStore`] backed by a single SQLite connection.
pub struct SqliteSchedulerStore {
    conn: Mutex<Connection>,
}

impl SqliteSchedulerStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a database file shared with other poller processes (WAL, busy timeout).
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "scheduler database opened");
        Self::new(conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }
}

const SCHEDULED_COLUMNS: &str =
    "id, worker_name, job_data, ts_executed, ts_execute, recurrence_id";

const RECURRING_COLUMNS: &str =
    "id, worker_name, job_data, ts_executed, interval, interval_unit";

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn micros_to_ts(idx: usize, raw: i64) -> rusqlite::Result<DateTime<Utc>> {
    from_micros(raw).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    micros_to_ts(idx, row.get(idx)?)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|micros| micros_to_ts(idx, micros)).transpose()
}

fn data_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobData> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn base_from_row(row: &Row<'_>) -> rusqlite::Result<JobBase> {
    Ok(JobBase {
        id: Some(row.get(0)?),
        worker_name: row.get(1)?,
        job_data: data_col(row, 2)?,
        time_executed: opt_ts_col(row, 3)?,
    })
}

fn scheduled_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    Ok(ScheduledJob {
        base: base_from_row(row)?,
        execute_time: ts_col(row, 4)?,
        recurrence_id: row.get(5)?,
    })
}

fn recurring_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringJob> {
    let unit: String = row.get(5)?;
    let interval_unit: IntervalUnit = unit.parse().map_err(|e| conversion_error(5, e))?;
    Ok(RecurringJob {
        base: base_from_row(row)?,
        interval: row.get(4)?,
        interval_unit,
    })
}

fn insert_scheduled(conn: &Connection, job: &ScheduledJob, data: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO worker_scheduled_jobs
         (worker_name, job_data, ts_entered, ts_execute, ts_executed, recurrence_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.base.worker_name,
            data,
            to_micros(Utc::now()),
            to_micros(job.execute_time),
            job.base.time_executed.map(to_micros),
            job.recurrence_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl SchedulerStore for SqliteSchedulerStore {
    #[instrument(skip(self, job), fields(worker = %job.base.worker_name, job_id = ?job.base.id))]
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<i64> {
        let data = serde_json::to_string(&job.base.job_data)?;
        let conn = self.lock()?;

        let id = match job.base.id {
            None => insert_scheduled(&conn, job, &data)?,
            Some(id) => {
                conn.execute(
                    "INSERT INTO worker_scheduled_jobs
                     (id, worker_name, job_data, ts_entered, ts_execute, ts_executed, recurrence_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        worker_name   = excluded.worker_name,
                        job_data      = excluded.job_data,
                        ts_execute    = excluded.ts_execute,
                        ts_executed   = excluded.ts_executed,
                        claimed_by    = CASE WHEN excluded.ts_executed IS NULL
                                             THEN NULL ELSE claimed_by END,
                        recurrence_id = excluded.recurrence_id",
                    params![
                        id,
                        job.base.worker_name,
                        data,
                        to_micros(Utc::now()),
                        to_micros(job.execute_time),
                        job.base.time_executed.map(to_micros),
                        job.recurrence_id,
                    ],
                )?;
                id
            }
        };

        debug!(job_id = id, "scheduled job saved");
        Ok(id)
    }

    #[instrument(skip(self))]
    fn get_scheduled_job(&self, id: i64) -> Result<Option<ScheduledJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM worker_scheduled_jobs WHERE id = ?1"),
                [id],
                scheduled_from_row,
            )
            .optional()?;
        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = ?job.base.id))]
    fn delete_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        let id = job.base.id.ok_or_else(|| {
            SchedulerError::InvalidArgument("cannot delete a scheduled job without an id".to_string())
        })?;
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM worker_scheduled_jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::NotFound {
                kind: "scheduled job",
                id,
            });
        }
        info!(job_id = id, "scheduled job deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    fn get_due_jobs(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM worker_scheduled_jobs
             WHERE ts_executed IS NULL AND ts_execute <= ?1
             ORDER BY ts_execute, id
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![to_micros(as_of), limit], scheduled_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(count = jobs.len(), "due jobs fetched");
        Ok(jobs)
    }

    #[instrument(skip(self))]
    fn claim_job(&self, id: i64, claimant: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE worker_scheduled_jobs SET ts_executed = ?1, claimed_by = ?2
             WHERE id = ?3 AND ts_executed IS NULL",
            params![to_micros(at), claimant, id],
        )?;
        Ok(n == 1)
    }

    #[instrument(skip(self))]
    fn release_claim(&self, id: i64, claimant: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE worker_scheduled_jobs SET ts_executed = NULL, claimed_by = NULL
             WHERE id = ?1 AND claimed_by = ?2 AND ts_executed = ?3",
            params![id, claimant, to_micros(at)],
        )?;
        Ok(n == 1)
    }

    #[instrument(skip(self, job), fields(worker = %job.base.worker_name, job_id = ?job.base.id))]
    fn save_recurring_job(&self, job: &RecurringJob) -> Result<i64> {
        if job.interval == 0 {
            return Err(SchedulerError::InvalidArgument(
                "recurring job interval must be at least 1".to_string(),
            ));
        }
        let data = serde_json::to_string(&job.base.job_data)?;
        let conn = self.lock()?;
        let now = to_micros(Utc::now());
        let executed = job.base.time_executed.map(to_micros);
        let unit = job.interval_unit.to_string();

        let id = match job.base.id {
            None => {
                conn.execute(
                    "INSERT INTO worker_recurring_jobs
                     (worker_name, job_data, interval, interval_unit, ts_entered, ts_executed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![job.base.worker_name, data, job.interval, unit, now, executed],
                )?;
                conn.last_insert_rowid()
            }
            Some(id) => {
                conn.execute(
                    "INSERT INTO worker_recurring_jobs
                     (id, worker_name, job_data, interval, interval_unit, ts_entered, ts_executed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        worker_name   = excluded.worker_name,
                        job_data      = excluded.job_data,
                        interval      = excluded.interval,
                        interval_unit = excluded.interval_unit,
                        ts_executed   = excluded.ts_executed",
                    params![id, job.base.worker_name, data, job.interval, unit, now, executed],
                )?;
                id
            }
        };

        debug!(recurring_id = id, "recurring job saved");
        Ok(id)
    }

    #[instrument(skip(self))]
    fn get_recurring_job(&self, id: i64) -> Result<Option<RecurringJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {RECURRING_COLUMNS} FROM worker_recurring_jobs WHERE id = ?1"),
                [id],
                recurring_from_row,
            )
            .optional()?;
        Ok(job)
    }

    #[instrument(skip(self))]
    fn get_all_recurring_jobs(&self) -> Result<Vec<RecurringJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECURRING_COLUMNS} FROM worker_recurring_jobs ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([], recurring_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(recurring_id = ?job.base.id))]
    fn delete_recurring_job(&self, job: &RecurringJob) -> Result<()> {
        let id = job.base.id.ok_or_else(|| {
            SchedulerError::InvalidArgument("cannot delete a recurring job without an id".to_string())
        })?;
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM worker_recurring_jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::NotFound {
                kind: "recurring job",
                id,
            });
        }
        info!(recurring_id = id, "recurring job deleted");
        Ok(())
    }

    #[instrument(skip(self, instance))]
    fn advance_recurring_job(
        &self,
        recurring_id: i64,
        previous: Option<DateTime<Utc>>,
        to_date: DateTime<Utc>,
        instance: &ScheduledJob,
    ) -> Result<Option<i64>> {
        let data = serde_json::to_string(&instance.base.job_data)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let moved = tx.execute(
            "UPDATE worker_recurring_jobs SET ts_executed = ?1
             WHERE id = ?2 AND ts_executed IS ?3",
            params![to_micros(to_date), recurring_id, previous.map(to_micros)],
        )?;
        if moved == 0 {
            // Dropping `tx` rolls back.
            debug!(recurring_id, "recurring job already advanced by another expander");
            return Ok(None);
        }

        let id = insert_scheduled(&tx, instance, &data)?;
        tx.commit()?;
        Ok(Some(id))
    }
}

/// Walks the due-job backlog in capped batches for one poll pass.
///
/// Every job handed out by [`next_batch`](Self::next_batch) must be
/// acknowledged through [`claim`](Self::claim) or [`skip`](Self::skip)
/// before the next batch is fetched; otherwise `next_batch` fails with
/// [`SchedulerError::UnacknowledgedBatch`] instead of returning the same
/// rows again. A job is never offered twice in one pass, even if its claim
/// was released.
///
/// The cursor owns a handle to its store so it can be moved onto a blocking
/// thread for the duration of each database call.
pub struct DueJobCursor {
    store: Arc<dyn SchedulerStore>,
    claimant: String,
    as_of: DateTime<Utc>,
    limit: usize,
    outstanding: HashSet<i64>,
    seen: HashSet<i64>,
    claims: HashMap<i64, DateTime<Utc>>,
    /// Seen jobs that are still due and occupy rows at the head of the query.
    still_due: usize,
    done: bool,
}

impl DueJobCursor {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        claimant: impl Into<String>,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Self {
        Self {
            store,
            claimant: claimant.into(),
            as_of,
            limit: limit.max(1),
            outstanding: HashSet::new(),
            seen: HashSet::new(),
            claims: HashMap::new(),
            still_due: 0,
            done: false,
        }
    }

    /// Fetch the next batch. An empty batch ends the pass.
    pub fn next_batch(&mut self) -> Result<Vec<ScheduledJob>> {
        if !self.outstanding.is_empty() {
            return Err(SchedulerError::UnacknowledgedBatch {
                outstanding: self.outstanding.len(),
            });
        }
        if self.done {
            return Ok(Vec::new());
        }

        let fetched = self
            .store
            .get_due_jobs(self.as_of, self.limit.saturating_add(self.still_due))?;
        let fresh: Vec<ScheduledJob> = fetched
            .into_iter()
            .filter(|job| job.base.id.is_some_and(|id| !self.seen.contains(&id)))
            .take(self.limit)
            .collect();

        if fresh.is_empty() {
            self.done = true;
            return Ok(fresh);
        }
        for job in &fresh {
            if let Some(id) = job.base.id {
                self.seen.insert(id);
                self.outstanding.insert(id);
            }
        }
        Ok(fresh)
    }

    /// Claim `job` for this poller. `false` means another poller got it first.
    pub fn claim(&mut self, job: &ScheduledJob) -> Result<bool> {
        let id = self.acknowledge(job)?;
        let at = Utc::now();
        let won = self.store.claim_job(id, &self.claimant, at)?;
        if won {
            self.claims.insert(id, at);
        } else {
            debug!(job_id = id, claimant = %self.claimant, "claim lost");
        }
        Ok(won)
    }

    /// Give back a claim taken in this pass; the job becomes due for a later pass.
    pub fn release(&mut self, job: &ScheduledJob) -> Result<bool> {
        let id = job.base.id.ok_or_else(missing_id)?;
        let Some(at) = self.claims.remove(&id) else {
            return Err(SchedulerError::InvalidArgument(format!(
                "job {id} was not claimed in this pass"
            )));
        };
        let released = self.store.release_claim(id, &self.claimant, at)?;
        if released {
            self.still_due += 1;
        } else {
            warn!(job_id = id, claimant = %self.claimant, "claim changed before release");
        }
        Ok(released)
    }

    /// Acknowledge `job` without claiming it; it stays due.
    pub fn skip(&mut self, job: &ScheduledJob) -> Result<()> {
        self.acknowledge(job)?;
        self.still_due += 1;
        Ok(())
    }

    pub fn claimant(&self) -> &str {
        &self.claimant
    }

    fn acknowledge(&mut self, job: &ScheduledJob) -> Result<i64> {
        let id = job.base.id.ok_or_else(missing_id)?;
        if !self.outstanding.remove(&id) {
            return Err(SchedulerError::InvalidArgument(format!(
                "job {id} is not part of the current batch"
            )));
        }
        Ok(id)
    }
}

fn missing_id() -> SchedulerError {
    SchedulerError::InvalidArgument("job has no id".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::types::JobValue;

    fn store() -> SqliteSchedulerStore {
        SqliteSchedulerStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn past(mins: i64) -> DateTime<Utc> {
        Utc::now() - TimeDelta::minutes(mins)
    }

    fn add_due(store: &SqliteSchedulerStore, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                let job = ScheduledJob::new(format!("worker-{i}"), past(100 - i as i64));
                store.save_scheduled_job(&job).unwrap()
            })
            .collect()
    }

    #[test]
    fn save_and_get_scheduled_job() {
        let store = store();
        let mut data = JobData::new();
        data.insert("user_id".into(), JobValue::Int(42));
        let execute_time = past(5);
        let job = ScheduledJob::new("email", execute_time).with_data(data.clone());

        let id = store.save_scheduled_job(&job).unwrap();
        let loaded = store.get_scheduled_job(id).unwrap().unwrap();

        assert_eq!(loaded.id(), Some(id));
        assert_eq!(loaded.worker_name(), "email");
        assert_eq!(loaded.job_data(), &data);
        assert!(loaded.is_pending());
        assert_eq!(to_micros(loaded.execute_time), to_micros(execute_time));
    }

    #[test]
    fn saving_twice_with_same_id_overwrites() {
        let store = store();
        let id = store
            .save_scheduled_job(&ScheduledJob::new("first", past(1)))
            .unwrap();

        let mut job = store.get_scheduled_job(id).unwrap().unwrap();
        job.base.worker_name = "second".into();
        assert_eq!(store.save_scheduled_job(&job).unwrap(), id);
        assert_eq!(store.save_scheduled_job(&job).unwrap(), id);

        let conn = store.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM worker_scheduled_jobs", [], |r| r.get(0))
            .unwrap();
        drop(conn);
        assert_eq!(rows, 1);
        assert_eq!(store.get_scheduled_job(id).unwrap().unwrap().worker_name(), "second");
    }

    #[test]
    fn delete_requires_id_and_existing_row() {
        let store = store();
        let unsaved = ScheduledJob::new("w", past(1));
        assert!(matches!(
            store.delete_scheduled_job(&unsaved),
            Err(SchedulerError::InvalidArgument(_))
        ));

        let id = store.save_scheduled_job(&unsaved).unwrap();
        let saved = store.get_scheduled_job(id).unwrap().unwrap();
        store.delete_scheduled_job(&saved).unwrap();
        assert!(store.get_scheduled_job(id).unwrap().is_none());
        assert!(matches!(
            store.delete_scheduled_job(&saved),
            Err(SchedulerError::NotFound { id: missing, .. }) if missing == id
        ));
    }

    #[test]
    fn due_jobs_exclude_future_and_executed() {
        let store = store();
        let ids = add_due(&store, 3);
        store
            .save_scheduled_job(&ScheduledJob::new("later", Utc::now() + TimeDelta::hours(1)))
            .unwrap();
        assert!(store.claim_job(ids[1], "test", Utc::now()).unwrap());

        let due = store.get_due_jobs(Utc::now(), 10).unwrap();
        let due_ids: Vec<_> = due.iter().filter_map(|j| j.id()).collect();
        assert_eq!(due_ids, vec![ids[0], ids[2]]);
        assert!(due.windows(2).all(|w| w[0].execute_time <= w[1].execute_time));
    }

    #[test]
    fn two_half_batches_cover_every_job_once() {
        let store = store();
        let mut ids = add_due(&store, 10);

        let mut delivered = Vec::new();
        for _ in 0..2 {
            for job in store.get_due_jobs(Utc::now(), 5).unwrap() {
                let id = job.id().unwrap();
                assert!(store.claim_job(id, "test", Utc::now()).unwrap());
                delivered.push(id);
            }
        }

        delivered.sort_unstable();
        ids.sort_unstable();
        assert_eq!(delivered, ids);
        assert!(store.get_due_jobs(Utc::now(), 5).unwrap().is_empty());
    }

    #[test]
    fn cursor_refuses_next_batch_until_acknowledged() {
        let store = Arc::new(store());
        add_due(&store, 4);
        let mut cursor = DueJobCursor::new(store.clone(), "p1", Utc::now(), 2);

        let batch = cursor.next_batch().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(cursor.claim(&batch[0]).unwrap());
        assert!(matches!(
            cursor.next_batch(),
            Err(SchedulerError::UnacknowledgedBatch { outstanding: 1 })
        ));

        assert!(cursor.claim(&batch[1]).unwrap());
        let second = cursor.next_batch().unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|j| !batch.iter().any(|b| b.id() == j.id())));
    }

    #[test]
    fn cursor_does_not_reoffer_released_jobs_in_same_pass() {
        let store = Arc::new(store());
        let ids = add_due(&store, 3);
        let mut cursor = DueJobCursor::new(store.clone(), "p1", Utc::now(), 1);

        let mut offered = Vec::new();
        loop {
            let batch = cursor.next_batch().unwrap();
            if batch.is_empty() {
                break;
            }
            for job in &batch {
                offered.push(job.id().unwrap());
                assert!(cursor.claim(job).unwrap());
                // Simulate a failed hand-off of the oldest job.
                if job.id() == Some(ids[0]) {
                    assert!(cursor.release(job).unwrap());
                }
            }
        }

        assert_eq!(offered, ids);
        let still_due: Vec<_> = store
            .get_due_jobs(Utc::now(), 10)
            .unwrap()
            .iter()
            .filter_map(|j| j.id())
            .collect();
        assert_eq!(still_due, vec![ids[0]]);
    }

    #[test]
    fn claim_is_won_once() {
        let store = store();
        let id = add_due(&store, 1)[0];
        assert!(store.claim_job(id, "p1", Utc::now()).unwrap());
        assert!(!store.claim_job(id, "p2", Utc::now()).unwrap());
    }

    #[test]
    fn release_only_undoes_own_claim() {
        let store = store();
        let id = add_due(&store, 1)[0];
        let at = Utc::now();
        assert!(store.claim_job(id, "p1", at).unwrap());
        assert!(!store.release_claim(id, "p2", at).unwrap());
        assert!(store.release_claim(id, "p1", at).unwrap());
        assert!(store.get_scheduled_job(id).unwrap().unwrap().is_pending());
    }

    #[test]
    fn concurrent_claims_across_connections_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let first = SqliteSchedulerStore::open(&path, Duration::from_secs(5)).unwrap();
        let id = add_due(&first, 1)[0];

        let stores = vec![
            Arc::new(first),
            Arc::new(SqliteSchedulerStore::open(&path, Duration::from_secs(5)).unwrap()),
        ];
        let barrier = Arc::new(Barrier::new(stores.len()));
        let handles: Vec<_> = stores
            .into_iter()
            .enumerate()
            .map(|(i, store)| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.claim_job(id, &format!("poller-{i}"), Utc::now()).unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn recurring_job_crud() {
        let store = store();
        let mut job = RecurringJob::new("report", IntervalUnit::Week, 2);
        job.base.job_data.insert("format".into(), JobValue::from("pdf"));

        let id = store.save_recurring_job(&job).unwrap();
        let mut loaded = store.get_recurring_job(id).unwrap().unwrap();
        assert_eq!(loaded.interval_unit, IntervalUnit::Week);
        assert_eq!(loaded.interval, 2);
        assert_eq!(loaded.base.job_data, job.base.job_data);

        loaded.interval = 3;
        store.save_recurring_job(&loaded).unwrap();
        store
            .save_recurring_job(&RecurringJob::new("other", IntervalUnit::Day, 1))
            .unwrap();

        let all = store.get_all_recurring_jobs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].interval, 3);

        store.delete_recurring_job(&all[1]).unwrap();
        assert_eq!(store.get_all_recurring_jobs().unwrap().len(), 1);
        assert!(store
            .save_recurring_job(&RecurringJob::new("bad", IntervalUnit::Day, 0))
            .is_err());
    }

    #[test]
    fn advance_recurring_job_is_compare_and_set() {
        let store = store();
        let rid = store
            .save_recurring_job(&RecurringJob::new("sync", IntervalUnit::Hour, 1))
            .unwrap();
        let to_date = Utc::now();
        let mut instance = ScheduledJob::new("sync", to_date);
        instance.recurrence_id = Some(rid);

        let created = store.advance_recurring_job(rid, None, to_date, &instance).unwrap();
        assert!(created.is_some());
        // A second expander still holding the stale value loses.
        assert!(store.advance_recurring_job(rid, None, to_date, &instance).unwrap().is_none());

        let due = store.get_due_jobs(to_date, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recurrence_id, Some(rid));
        let recurring = store.get_recurring_job(rid).unwrap().unwrap();
        assert_eq!(recurring.base.time_executed.map(to_micros), Some(to_micros(to_date)));
    }

    #[test]
    fn stored_timestamps_round_trip_at_microsecond_precision() {
        let now = Utc::now();
        let stored = to_micros(now);
        assert!(to_micros(now - TimeDelta::seconds(1)) < stored);
        assert_eq!(from_micros(stored).map(to_micros), Some(stored));
    }

    #[test]
    fn far_future_job_is_not_due_and_does_not_break_the_due_query() {
        let store = store();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let id = store.save_scheduled_job(&ScheduledJob::new("far", far)).unwrap();
        let due_id = add_due(&store, 1)[0];

        let due = store.get_due_jobs(Utc::now(), 10).unwrap();
        assert_eq!(due.iter().filter_map(|j| j.id()).collect::<Vec<_>>(), vec![due_id]);

        let loaded = store.get_scheduled_job(id).unwrap().unwrap();
        assert_eq!(loaded.execute_time, far);
        assert_eq!(store.get_due_jobs(far, 10).unwrap().len(), 2);
    }
}
