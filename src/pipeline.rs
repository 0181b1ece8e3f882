//! Per-series extraction: fetch, normalize, persist, then optionally notify.

use std::time::Duration;

use chrono::NaiveDateTime;

use crate::config::{Config, DatabaseBackend, NotifierConfig, OptionsConfig, SinkMode};
use crate::error::{AppError, SinkError};
use crate::model::bar::TIMESTAMP_FORMAT;
use crate::model::Series;
use crate::normalizer::normalize;
use crate::notifier::{summarize, Notify};
use crate::options::{snapshot_time, OptionChainSource};
use crate::retry::RetryPolicy;
use crate::sink::{CsvSink, OptionChainSink, PostgresSink, Sink, SqliteSink, WriteReport};
use crate::source::{drop_after_close, fetch_series, lookback_range, MarketDataSource};

/// Settings shared by every series in one invocation.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub days: u32,
    pub policy: RetryPolicy,
    pub chunk_pause: Duration,
    pub now: NaiveDateTime,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone)]
pub struct SeriesOutcome {
    pub series: Series,
    pub range: String,
    pub fetched: usize,
    pub writes: Vec<WriteReport>,
    pub notified: bool,
}

/// Open the sinks `mode` selects. Each caller gets its own handles.
pub fn open_sinks(config: &Config, mode: SinkMode, days: u32) -> Result<Vec<Box<dyn Sink>>, SinkError> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    if mode.wants_file() {
        sinks.push(Box::new(CsvSink::new(config.output.dir.clone(), days)));
    }
    if mode.wants_database() {
        match config.database.backend {
            DatabaseBackend::Postgres => {
                sinks.push(Box::new(PostgresSink::connect(&config.database)?));
            }
            DatabaseBackend::Sqlite => {
                sinks.push(Box::new(SqliteSink::open(&config.database.sqlite_path)?));
            }
        }
    }
    Ok(sinks)
}

pub fn run_series<S: MarketDataSource + ?Sized>(
    source: &S,
    job: &Extraction,
    series: &Series,
    sinks: &mut [Box<dyn Sink>],
    notifier: Option<&dyn Notify>,
) -> Result<SeriesOutcome, AppError> {
    let max_days = series.interval.max_days();
    if job.days == 0 || job.days > max_days {
        return Err(AppError::Config(format!(
            "{}: lookback of {} days is outside 1..={}",
            series, job.days, max_days
        )));
    }

    let range = lookback_range(job.days, series.interval, job.now);
    tracing::info!(series = %series, range = %range, days = job.days, "Extracting series");

    let bars = fetch_series(source, &job.policy, series, &range, job.chunk_pause)?;
    let bars = drop_after_close(bars, series.interval, job.now);
    let records = normalize(series, &bars);

    let mut writes = Vec::with_capacity(sinks.len());
    for sink in sinks.iter_mut() {
        let report = sink
            .write_batch(series, &records)
            .map_err(|source| AppError::Sink {
                series: series.to_string(),
                range: range.to_string(),
                source,
            })?;
        writes.push(report);
    }

    let mut notified = false;
    if let Some(notifier) = notifier {
        let text = summarize(series, &records, &job.notifier);
        match notifier.send(&text) {
            Ok(()) => notified = true,
            Err(e) => {
                tracing::warn!(series = %series, error = %e, "Summary notification failed");
            }
        }
    }

    Ok(SeriesOutcome {
        series: series.clone(),
        range: range.to_string(),
        fetched: records.len(),
        writes,
        notified,
    })
}

/// The configured database, for option-chain snapshots.
pub fn open_option_sink(config: &Config) -> Result<Box<dyn OptionChainSink>, SinkError> {
    Ok(match config.database.backend {
        DatabaseBackend::Postgres => Box::new(PostgresSink::connect(&config.database)?),
        DatabaseBackend::Sqlite => Box::new(SqliteSink::open(&config.database.sqlite_path)?),
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub taken_at: NaiveDateTime,
    pub rows: usize,
    pub write: WriteReport,
}

/// Take one option-chain snapshot through `policy` and upsert it.
pub fn run_option_snapshot<S: OptionChainSource + ?Sized>(
    source: &S,
    policy: &RetryPolicy,
    cfg: &OptionsConfig,
    now: NaiveDateTime,
    sink: &mut dyn OptionChainSink,
) -> Result<SnapshotOutcome, AppError> {
    let label = format!("{} options", cfg.underlying);
    let taken_at = snapshot_time(now, cfg.bucket_minutes);
    let at = taken_at.format(TIMESTAMP_FORMAT).to_string();

    let outcome = policy.run(|_| source.option_chain(cfg, now));
    let snapshots = match outcome.result {
        Ok(rows) => rows,
        Err(e) if policy.is_transient(&e) => {
            return Err(AppError::TransientFetch {
                series: label,
                range: at,
                attempts: outcome.attempts,
                source: e,
            })
        }
        Err(e) => {
            return Err(AppError::PermanentFetch {
                series: label,
                range: at,
                source: e,
            })
        }
    };
    tracing::info!(underlying = %cfg.underlying, at = %at, rows = snapshots.len(), "Option chain fetched");

    let write = sink
        .write_snapshots(&cfg.table, &snapshots)
        .map_err(|source| AppError::Sink {
            series: label,
            range: at,
            source,
        })?;
    Ok(SnapshotOutcome {
        taken_at,
        rows: snapshots.len(),
        write,
    })
}
