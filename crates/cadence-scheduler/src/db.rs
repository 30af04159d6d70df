use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `worker_scheduled_jobs` and `worker_recurring_jobs` (idempotent)
/// plus the index the due-jobs query runs on. Timestamps are INTEGER
/// microseconds since the Unix epoch (UTC), which order correctly for every
/// representable date.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS worker_scheduled_jobs (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_name    TEXT    NOT NULL,
            job_data       TEXT    NOT NULL DEFAULT '{}',  -- JSON object of scalars
            ts_entered     INTEGER NOT NULL,
            ts_execute     INTEGER NOT NULL,
            ts_executed    INTEGER,                        -- NULL while pending
            claimed_by     TEXT,                           -- poller that acknowledged the job
            recurrence_id  INTEGER                         -- worker_recurring_jobs.id
        ) STRICT;

        -- Due-jobs query: WHERE ts_executed IS NULL AND ts_execute <= ? ORDER BY ts_execute
        CREATE INDEX IF NOT EXISTS idx_scheduled_due
            ON worker_scheduled_jobs (ts_executed, ts_execute);

        CREATE TABLE IF NOT EXISTS worker_recurring_jobs (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_name    TEXT    NOT NULL,
            job_data       TEXT    NOT NULL DEFAULT '{}',
            interval       INTEGER NOT NULL CHECK (interval > 0),
            interval_unit  TEXT    NOT NULL,
            ts_entered     INTEGER NOT NULL,
            ts_executed    INTEGER                         -- last expansion, NULL if never
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name LIKE 'worker_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn recurring_interval_must_be_positive() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO worker_recurring_jobs (worker_name, interval, interval_unit, ts_entered)
             VALUES ('w', 0, 'day', 0)",
            [],
        );
        assert!(res.is_err());
    }
}
