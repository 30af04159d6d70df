use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{
    SchedulerConfig, DEFAULT_BATCH_SIZE, DEFAULT_EXPAND_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_SECS,
};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{DispatchError, Result, SchedulerError},
    service::SchedulerService,
    store::{DueJobCursor, SchedulerStore},
    types::ScheduledJob,
};

/// Hands a due job to the worker runtime.
///
/// Implementations must return once the job is accepted, not when it has
/// finished running.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, job: &ScheduledJob) -> std::result::Result<(), DispatchError>;
}

/// Forwards jobs over a bounded mpsc channel without waiting for capacity.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<ScheduledJob>,
}

impl ChannelDispatcher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ScheduledJob>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkerDispatcher for ChannelDispatcher {
    async fn dispatch(&self, job: &ScheduledJob) -> std::result::Result<(), DispatchError> {
        // try_send never blocks the tick loop.
        self.tx.try_send(job.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// What one poll pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Claimed and accepted by the dispatcher.
    pub dispatched: usize,
    /// Claimed by another poller between fetch and claim.
    pub lost_claims: usize,
    /// Refused by the dispatcher; the claim was released.
    pub failed: usize,
}

/// Polls the due-jobs table and hands each job to a [`WorkerDispatcher`].
pub struct SchedulerEngine {
    service: SchedulerService,
    dispatcher: Arc<dyn WorkerDispatcher>,
    poller_id: String,
    batch_size: usize,
    poll_interval: Duration,
    /// `None` disables recurring-job expansion in this process.
    expand_interval: Option<Duration>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn SchedulerStore>, dispatcher: Arc<dyn WorkerDispatcher>) -> Self {
        Self {
            service: SchedulerService::new(store),
            dispatcher,
            poller_id: Uuid::new_v4().to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            expand_interval: Some(Duration::from_secs(DEFAULT_EXPAND_INTERVAL_SECS)),
        }
    }

    /// Build an engine from the `[scheduler]` config section.
    pub fn from_config(
        store: Arc<dyn SchedulerStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        config: &SchedulerConfig,
    ) -> Self {
        let engine = Self::new(store, dispatcher)
            .with_batch_size(config.batch_size)
            .with_poll_interval(Duration::from_secs(config.poll_interval_secs))
            .with_expand_interval(Some(Duration::from_secs(config.expand_interval_secs)));
        match &config.poller_id {
            Some(id) => engine.with_poller_id(id.clone()),
            None => engine,
        }
    }

    pub fn with_poller_id(mut self, poller_id: impl Into<String>) -> Self {
        self.poller_id = poller_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_expand_interval(mut self, expand_interval: Option<Duration>) -> Self {
        self.expand_interval = expand_interval;
        self
    }

    pub fn poller_id(&self) -> &str {
        &self.poller_id
    }

    pub fn service(&self) -> &SchedulerService {
        &self.service
    }

    /// Main event loop. Polls until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poller_id = %self.poller_id, "scheduler engine started");

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expand_enabled = self.expand_interval.is_some();
        let mut expand = tokio::time::interval(self.expand_interval.unwrap_or(self.poll_interval));
        expand.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report != TickReport::default() => {
                            debug!(
                                dispatched = report.dispatched,
                                lost_claims = report.lost_claims,
                                failed = report.failed,
                                "poll pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(code = e.code(), "scheduler tick error: {e}"),
                    }
                }
                _ = expand.tick(), if expand_enabled => {
                    let service = self.service.clone();
                    let expanded = blocking(move || service.expand_recurring_jobs(Utc::now()))
                        .await
                        .and_then(|r| r);
                    if let Err(e) = expanded {
                        error!(code = e.code(), "recurring expansion error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(poller_id = %self.poller_id, "scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch every job due at `now`, batch by batch, until the backlog is drained.
    ///
    /// Each batch is claimed before hand-off so no other poller can deliver
    /// it; a refused hand-off releases the claim and the job waits for the
    /// next tick. Store calls run on the blocking pool, never on the runtime
    /// thread that drives dispatch.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut cursor = DueJobCursor::new(self.service.store_handle(), self.poller_id.clone(), now, self.batch_size);

        loop {
            let (returned, claimed) = blocking(move || {
                let claimed = claim_next_batch(&mut cursor);
                (cursor, claimed)
            })
            .await?;
            cursor = returned;
            let Some(batch) = claimed? else {
                break;
            };
            report.lost_claims += batch.lost;

            let mut refused = Vec::new();
            for job in batch.won {
                match self.dispatcher.dispatch(&job).await {
                    Ok(()) => {
                        info!(job_id = ?job.id(), worker = %job.worker_name(), "job dispatched");
                        report.dispatched += 1;
                    }
                    Err(e) => {
                        warn!(job_id = ?job.id(), worker = %job.worker_name(), "hand-off failed: {e}");
                        refused.push(job);
                    }
                }
            }

            if !refused.is_empty() {
                report.failed += refused.len();
                let (returned, released) = blocking(move || {
                    let released = release_refused(&mut cursor, &refused);
                    (cursor, released)
                })
                .await?;
                cursor = returned;
                released?;
            }

            if let Some(e) = batch.interrupted {
                return Err(e);
            }
        }

        Ok(report)
    }
}

/// Jobs this poller won from one batch.
struct ClaimedBatch {
    won: Vec<ScheduledJob>,
    lost: usize,
    /// A claim failed part-way; `won` still holds what was claimed before it.
    interrupted: Option<SchedulerError>,
}

/// Fetch and claim the next batch. `None` ends the pass.
fn claim_next_batch(cursor: &mut DueJobCursor) -> Result<Option<ClaimedBatch>> {
    let batch = cursor.next_batch()?;
    if batch.is_empty() {
        return Ok(None);
    }

    let mut claimed = ClaimedBatch {
        won: Vec::with_capacity(batch.len()),
        lost: 0,
        interrupted: None,
    };
    for job in batch {
        match cursor.claim(&job) {
            Ok(true) => claimed.won.push(job),
            Ok(false) => claimed.lost += 1,
            Err(e) => {
                claimed.interrupted = Some(e);
                break;
            }
        }
    }
    Ok(Some(claimed))
}

/// Release every refused job, returning the first failure after trying them all.
fn release_refused(cursor: &mut DueJobCursor, refused: &[ScheduledJob]) -> Result<()> {
    let mut first_err = None;
    for job in refused {
        if let Err(e) = cursor.release(job) {
            error!(
                job_id = ?job.id(),
                worker = %job.worker_name(),
                code = e.code(),
                "job left claimed after failed hand-off: {e}"
            );
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Run synchronous SQLite work on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SchedulerError::BlockingTask(e.to_string()))
}
