use cadence_recurrence::RecurrenceError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No row with the given id exists.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: i64 },

    /// The caller passed something the operation cannot act on (e.g. a job without an id).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored interval unit the engine does not implement.
    #[error("Unsupported interval unit: {0}")]
    UnsupportedUnit(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed recurrence pattern.
    #[error("Recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    /// `next_batch` was called while jobs from the previous batch were neither
    /// claimed nor released.
    #[error("{outstanding} job(s) from the previous batch were not acknowledged")]
    UnacknowledgedBatch { outstanding: usize },

    /// Timestamp arithmetic left the representable range.
    #[error("Time overflow: {0}")]
    TimeOverflow(String),

    /// A thread panicked while holding the connection lock.
    #[error("Connection lock poisoned")]
    LockPoisoned,

    /// A store call moved off the async runtime panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    BlockingTask(String),
}

impl SchedulerError {
    /// Short error code string used in log fields and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SchedulerError::UnsupportedUnit(_) => "UNSUPPORTED_UNIT",
            SchedulerError::Persistence(_) => "PERSISTENCE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Recurrence(_) => "RECURRENCE_ERROR",
            SchedulerError::UnacknowledgedBatch { .. } => "UNACKNOWLEDGED_BATCH",
            SchedulerError::TimeOverflow(_) => "TIME_OVERFLOW",
            SchedulerError::LockPoisoned => "LOCK_POISONED",
            SchedulerError::BlockingTask(_) => "BLOCKING_TASK",
        }
    }

    /// Operational failures the poll loop should log and retry on the next tick.
    ///
    /// Everything else points at bad data or a caller bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Persistence(_)
                | SchedulerError::LockPoisoned
                | SchedulerError::BlockingTask(_)
        )
    }
}

/// A worker hand-off was refused. The job stays due and is offered again later.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The receiving queue is full.
    #[error("dispatch queue full")]
    Full,

    /// The receiving side has gone away.
    #[error("dispatch queue closed")]
    Closed,

    /// The worker runtime rejected the job.
    #[error("worker rejected job: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_are_recoverable() {
        let err = SchedulerError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_recoverable());
        assert_eq!(err.code(), "PERSISTENCE_ERROR");

        let err = SchedulerError::BlockingTask("task cancelled".into());
        assert!(err.is_recoverable());
        assert_eq!(err.code(), "BLOCKING_TASK");
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        assert!(!SchedulerError::UnsupportedUnit("fortnight".into()).is_recoverable());
        assert!(!SchedulerError::from(RecurrenceError::OutOfRange).is_recoverable());
        assert_eq!(
            SchedulerError::NotFound { kind: "scheduled job", id: 7 }.to_string(),
            "scheduled job not found: 7"
        );
    }
}
