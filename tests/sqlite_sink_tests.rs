use chrono::{NaiveDate, NaiveDateTime};

use kite_recorder::error::SinkError;
use kite_recorder::model::{BarRecord, Interval, RawBar, Series};
use kite_recorder::normalizer::normalize;
use kite_recorder::sink::{Sink, SqliteSink};

fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 2, d)
        .expect("valid date")
        .and_hms_opt(h, m, 0)
        .expect("valid time")
}

fn batch(series: &Series, closes: &[(NaiveDateTime, f64)]) -> Vec<BarRecord> {
    let raw: Vec<RawBar> = closes
        .iter()
        .map(|&(ts, close)| RawBar {
            timestamp: ts,
            open: 100.0,
            high: close.max(100.0) + 0.5,
            low: close.min(100.0) - 0.5,
            close,
            volume: 5_000,
        })
        .collect();
    normalize(series, &raw)
}

#[test]
/// A retried run re-sends the same timestamps: row count stays put and the
/// stored values are the second run's.
fn rerun_upserts_instead_of_duplicating() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("data").join("bars.sqlite");
    let series = Series::new("NIFTY 50", Interval::Minute);
    let mut sink = SqliteSink::open(&db).expect("open sqlite");

    let first = batch(&series, &[(at(1, 9, 15), 101.0), (at(1, 9, 16), 102.0)]);
    let report = sink.write_batch(&series, &first).expect("first write");
    assert_eq!((report.inserted, report.updated, report.total_rows), (2, 0, 2));
    assert!(report.target.ends_with(":nifty_1m"));

    let second = batch(&series, &[(at(1, 9, 15), 99.0), (at(1, 9, 16), 104.0)]);
    let report = sink.write_batch(&series, &second).expect("second write");
    assert_eq!((report.inserted, report.updated, report.total_rows), (0, 2, 2));

    let stored = sink.load(&series).expect("load");
    assert_eq!(stored, second);
}

#[test]
/// Writing the same batch twice leaves the same table as writing it once.
fn same_batch_twice_is_idempotent() {
    let mut sink = SqliteSink::in_memory().expect("in-memory sqlite");
    let series = Series::new("RELIANCE", Interval::Minute5);
    let rows = batch(
        &series,
        &[(at(5, 9, 15), 2900.0), (at(5, 9, 20), 2905.25), (at(5, 9, 25), 2899.5)],
    );

    sink.write_batch(&series, &rows).expect("first write");
    let once = sink.load(&series).expect("load once");
    sink.write_batch(&series, &rows).expect("second write");
    let twice = sink.load(&series).expect("load twice");

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 3);
}

#[test]
/// Overlapping batches keep one row per timestamp and report the span.
fn overlapping_batches_stay_unique() {
    let mut sink = SqliteSink::in_memory().expect("in-memory sqlite");
    let series = Series::new("TCS", Interval::Day);
    let days: Vec<(NaiveDateTime, f64)> = (1..=6).map(|d| (at(d, 0, 0), 100.0 + d as f64)).collect();

    sink.write_batch(&series, &batch(&series, &days[..4])).expect("write");
    let report = sink.write_batch(&series, &batch(&series, &days[2..])).expect("write");
    assert_eq!((report.inserted, report.updated, report.total_rows), (2, 2, 6));

    let info = sink.describe(&series).expect("describe").expect("table exists");
    assert_eq!(info.row_count, 6);
    assert_eq!(info.first, Some(at(1, 0, 0)));
    assert_eq!(info.last, Some(at(6, 0, 0)));
}

#[test]
/// An existing table with other columns is reported before any write.
fn foreign_table_is_a_schema_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("bars.sqlite");
    {
        let conn = rusqlite::Connection::open(&db).expect("seed db");
        conn.execute_batch(
            "CREATE TABLE nifty_5m (ts TEXT PRIMARY KEY, price REAL);
             INSERT INTO nifty_5m VALUES ('2024-02-01 09:15:00', 1.0);",
        )
        .expect("seed table");
    }

    let series = Series::new("NIFTY", Interval::Minute5);
    let mut sink = SqliteSink::open(&db).expect("open sqlite");
    let err = sink
        .write_batch(&series, &batch(&series, &[(at(1, 9, 15), 101.0)]))
        .unwrap_err();
    match err {
        SinkError::SchemaMismatch { target, found, .. } => {
            assert!(target.ends_with(":nifty_5m"));
            assert_eq!(found, vec!["ts".to_string(), "price".to_string()]);
        }
        other => panic!("expected SchemaMismatch, got {:?}", other),
    }

    let conn = rusqlite::Connection::open(&db).expect("reopen");
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM nifty_5m", [], |r| r.get(0))
        .expect("count");
    assert_eq!(n, 1);
}

#[test]
/// Nothing stored yet means no info rather than an error.
fn describe_missing_table_is_none() {
    let mut sink = SqliteSink::in_memory().expect("in-memory sqlite");
    let series = Series::new("SBIN", Interval::Hour);
    assert!(sink.describe(&series).expect("describe").is_none());
}

#[test]
/// A stored volume that does not fit `u64` fails the load instead of becoming 0.
fn negative_stored_volume_fails_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("bars.sqlite");
    let series = Series::new("INFY", Interval::Day);
    let mut sink = SqliteSink::open(&db).expect("open sqlite");
    sink.write_batch(&series, &batch(&series, &[(at(1, 0, 0), 101.0)]))
        .expect("write");

    {
        let conn = rusqlite::Connection::open(&db).expect("reopen");
        conn.execute("UPDATE infy_day SET volume = -5", [])
            .expect("corrupt volume");
    }

    let err = sink.load(&series).unwrap_err();
    assert!(matches!(err, SinkError::Persistence { .. }), "got {:?}", err);
}

#[test]
/// A volume above `i64::MAX` rejects the whole batch and leaves stored rows alone.
fn oversized_volume_rejects_batch() {
    let mut sink = SqliteSink::in_memory().expect("in-memory sqlite");
    let series = Series::new("HDFCBANK", Interval::Day);
    let stored = batch(&series, &[(at(1, 0, 0), 101.0)]);
    sink.write_batch(&series, &stored).expect("first write");

    let mut next = batch(&series, &[(at(1, 0, 0), 90.0), (at(2, 0, 0), 102.0)]);
    next[1].volume = u64::MAX;
    let err = sink.write_batch(&series, &next).unwrap_err();
    match err {
        SinkError::Persistence { target, .. } => assert!(target.ends_with(":hdfcbank_day")),
        other => panic!("expected Persistence, got {:?}", other),
    }

    assert_eq!(sink.load(&series).expect("load"), stored);
}
