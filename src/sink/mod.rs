//! Persistence targets for normalized bars.
//!
//! Every sink keys rows on `date`: writing a batch inserts new timestamps and
//! overwrites existing ones, so replaying a batch never duplicates a row.

pub mod csv_file;
pub mod option_chain;
pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::error::SinkError;
use crate::model::{BarRecord, Series, COLUMNS};

pub use self::csv_file::CsvSink;
pub use self::option_chain::OptionChainSink;
pub use self::postgres::PostgresSink;
pub use self::sqlite::SqliteSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub target: String,
    pub inserted: usize,
    pub updated: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub target: String,
    pub row_count: usize,
    pub first: Option<NaiveDateTime>,
    pub last: Option<NaiveDateTime>,
}

pub trait Sink {
    /// Human-readable name of where `series` lands (file path or table).
    fn target(&self, series: &Series) -> String;

    fn write_batch(
        &mut self,
        series: &Series,
        records: &[BarRecord],
    ) -> Result<WriteReport, SinkError>;

    /// Row count and span of what is stored for `series`, or `None` if nothing is.
    fn describe(&mut self, series: &Series) -> Result<Option<TargetInfo>, SinkError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn target(&self, series: &Series) -> String {
        (**self).target(series)
    }

    fn write_batch(
        &mut self,
        series: &Series,
        records: &[BarRecord],
    ) -> Result<WriteReport, SinkError> {
        (**self).write_batch(series, records)
    }

    fn describe(&mut self, series: &Series) -> Result<Option<TargetInfo>, SinkError> {
        (**self).describe(series)
    }
}

/// Result of merging a batch into already-stored rows.
#[derive(Debug)]
pub struct Merged {
    pub rows: BTreeMap<NaiveDateTime, BarRecord>,
    pub inserted: usize,
    pub updated: usize,
}

/// Merge `incoming` into `existing` by timestamp; incoming rows win.
pub fn merge_by_timestamp(
    mut existing: BTreeMap<NaiveDateTime, BarRecord>,
    incoming: &[BarRecord],
) -> Merged {
    let mut inserted = 0;
    let mut updated = 0;
    for rec in incoming {
        match existing.insert(rec.date, rec.clone()) {
            Some(_) => updated += 1,
            None => inserted += 1,
        }
    }
    Merged {
        rows: existing,
        inserted,
        updated,
    }
}

/// Existing targets must carry exactly the fixed column set.
pub fn check_columns(target: &str, found: &[String]) -> Result<(), SinkError> {
    check_column_set(target, &COLUMNS, found)
}

/// Order-insensitive comparison of `found` against `expected`.
pub fn check_column_set(target: &str, expected: &[&str], found: &[String]) -> Result<(), SinkError> {
    let mut want: Vec<&str> = expected.to_vec();
    let mut have: Vec<&str> = found.iter().map(String::as_str).collect();
    want.sort_unstable();
    have.sort_unstable();
    if want == have {
        return Ok(());
    }
    Err(SinkError::SchemaMismatch {
        target: target.to_string(),
        expected: expected.iter().map(|c| c.to_string()).collect(),
        found: found.to_vec(),
    })
}

/// Counts from row totals before/after an upsert of `batch_len` distinct keys.
pub(crate) fn upsert_counts(before: usize, after: usize, batch_len: usize) -> (usize, usize) {
    let inserted = after.saturating_sub(before);
    (inserted, batch_len.saturating_sub(inserted))
}
