use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_recurrence::RecurrencePattern;
use cadence_scheduler::{
    ChannelDispatcher, IntervalUnit, JobData, SchedulerEngine, SchedulerService, SchedulerStore,
    SqliteSchedulerStore,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cadence", version, about = "Job scheduler with claim-once dispatch")]
struct Cli {
    /// Path to cadence.toml (falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll for due jobs and hand them off as JSON lines on stdout.
    Run,
    /// Schedule a one-off job.
    Schedule {
        #[arg(long)]
        worker: String,
        /// RFC 3339 instant; defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// JSON object of scalar values passed to the worker.
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Register a recurring job.
    Every {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        interval: u32,
        /// second, minute, hour, day, week or month.
        #[arg(long)]
        unit: String,
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Schedule one job per occurrence of a calendar series.
    Series {
        #[arg(long)]
        worker: String,
        /// Recurrence pattern as JSON, e.g. {"recur_type":"monthly","date_start":"2026-01-01T09:00:00","day_of_month":15}.
        #[arg(long)]
        pattern: String,
        /// RFC 3339 instant; the last occurrence scheduled is on or before it.
        #[arg(long)]
        until: DateTime<Utc>,
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// List due jobs without claiming them.
    Due {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Run one recurring-job expansion pass.
    Expand {
        /// RFC 3339 instant; defaults to now.
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let loaded = CadenceConfig::load(config_path.as_deref());

    let default_filter = loaded
        .as_ref()
        .map(|c| c.logging.filter.clone())
        .unwrap_or_else(|_| cadence_core::config::DEFAULT_LOG_FILTER.to_string());
    // Logs go to stderr; stdout carries dispatched jobs.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = loaded.unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    config.validate().context("invalid configuration")?;

    let store = open_store(&config)?;
    let service = SchedulerService::new(Arc::clone(&store));

    match cli.command {
        Command::Run => run(store, &config).await,
        Command::Schedule { worker, at, data } => {
            let id = service.schedule_at_time(&worker, at.unwrap_or_else(Utc::now), parse_data(&data)?)?;
            println!("{id}");
            Ok(())
        }
        Command::Every {
            worker,
            interval,
            unit,
            data,
        } => {
            let unit: IntervalUnit = unit.parse()?;
            let id = service.schedule_at_interval(&worker, parse_data(&data)?, unit, interval)?;
            println!("{id}");
            Ok(())
        }
        Command::Series {
            worker,
            pattern,
            until,
            data,
        } => {
            let pattern = parse_pattern(&pattern)?;
            for id in service.schedule_pattern(&worker, parse_data(&data)?, &pattern, until)? {
                println!("{id}");
            }
            Ok(())
        }
        Command::Due { limit } => {
            for job in service.due_jobs(Utc::now(), limit)? {
                println!("{}", serde_json::to_string(&job)?);
            }
            Ok(())
        }
        Command::Expand { to } => {
            let created = service.expand_recurring_jobs(to.unwrap_or_else(Utc::now))?;
            println!("{created}");
            Ok(())
        }
    }
}

async fn run(store: Arc<dyn SchedulerStore>, config: &CadenceConfig) -> anyhow::Result<()> {
    let (dispatcher, mut handed_off) = ChannelDispatcher::new(config.scheduler.dispatch_buffer);
    let engine = SchedulerEngine::from_config(store, Arc::new(dispatcher), &config.scheduler);
    info!(
        poller_id = %engine.poller_id(),
        poll_interval_secs = config.scheduler.poll_interval_secs,
        batch_size = config.scheduler.batch_size,
        "starting poller"
    );

    // Worker runtime side of the hand-off: one JSON line per job.
    let consumer = tokio::spawn(async move {
        while let Some(job) = handed_off.recv().await {
            match serde_json::to_string(&job) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(job_id = ?job.id(), "could not encode job: {e}"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    engine_task.await?;
    // The engine owned the only sender; the consumer drains and exits.
    consumer.await?;
    Ok(())
}

fn open_store(config: &CadenceConfig) -> anyhow::Result<Arc<dyn SchedulerStore>> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let store = SqliteSchedulerStore::open(
        Path::new(db_path),
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("failed to open {db_path}"))?;
    Ok(Arc::new(store))
}

fn parse_data(raw: &str) -> anyhow::Result<JobData> {
    serde_json::from_str(raw).context("--data must be a JSON object of scalar values")
}

fn parse_pattern(raw: &str) -> anyhow::Result<RecurrencePattern> {
    serde_json::from_str(raw).context("--pattern must be a JSON recurrence pattern")
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::JobValue;

    #[test]
    fn parses_schedule_subcommand() {
        let cli = Cli::try_parse_from([
            "cadence",
            "--config",
            "/tmp/c.toml",
            "schedule",
            "--worker",
            "email",
            "--at",
            "2026-05-01T09:00:00Z",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/c.toml"));
        match cli.command {
            Command::Schedule { worker, at, data } => {
                assert_eq!(worker, "email");
                assert_eq!(at.unwrap().to_rfc3339(), "2026-05-01T09:00:00+00:00");
                assert_eq!(data, "{}");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn every_requires_interval_and_unit() {
        assert!(Cli::try_parse_from(["cadence", "every", "--worker", "w"]).is_err());
        assert!(Cli::try_parse_from(["cadence", "every", "--worker", "w", "--interval", "2", "--unit", "week"]).is_ok());
    }

    #[test]
    fn job_data_flag_rejects_nested_values() {
        let data = parse_data(r#"{"id": 7, "name": "x"}"#).unwrap();
        assert_eq!(data["id"], JobValue::Int(7));
        assert!(parse_data(r#"{"nested": {"a": 1}}"#).is_err());
        assert!(parse_data("not json").is_err());
    }

    #[test]
    fn series_pattern_flag_parses_json() {
        let pattern = parse_pattern(
            r#"{"recur_type":"monthly","date_start":"2026-01-01T09:00:00","day_of_month":15}"#,
        )
        .unwrap();
        assert_eq!(pattern.day_of_month, Some(15));
        assert_eq!(pattern.interval, 1);
        assert!(parse_pattern(r#"{"recur_type":"fortnightly","date_start":"2026-01-01T09:00:00"}"#).is_err());

        let cli = Cli::try_parse_from([
            "cadence",
            "series",
            "--worker",
            "report",
            "--pattern",
            "{}",
            "--until",
            "2026-12-31T00:00:00Z",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Series { .. }));
    }
}
