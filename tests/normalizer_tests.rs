use chrono::{NaiveDate, NaiveDateTime};

use kite_recorder::error::AppError;
use kite_recorder::model::{Interval, RawBar, Series};
use kite_recorder::normalizer::{normalize, validate_order};

fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 2)
        .expect("valid date")
        .and_hms_opt(h, m, 0)
        .expect("valid time")
}

fn raw(ts: NaiveDateTime, open: f64, high: f64, low: f64, close: f64) -> RawBar {
    RawBar {
        timestamp: ts,
        open,
        high,
        low,
        close,
        volume: 12_500,
    }
}

#[test]
/// Synthetic bars that satisfy OHLC integrity keep it after normalization.
fn normalized_output_preserves_ohlc_bounds() {
    let series = Series::new("NIFTY", Interval::Minute5);
    let bars = vec![
        raw(at(9, 15), 100.0, 106.0, 99.5, 105.0),
        raw(at(9, 20), 105.0, 105.5, 101.0, 101.25),
        raw(at(9, 25), 101.25, 101.25, 101.25, 101.25),
    ];
    assert!(bars.iter().all(RawBar::is_consistent));

    let records = normalize(&series, &bars);
    assert_eq!(records.len(), 3);
    for r in &records {
        assert!(r.high >= r.open.max(r.close));
        assert!(r.low <= r.open.min(r.close));
        assert!(r.high_low_range >= 0.0);
    }
}

#[test]
/// First bar of the NIFTY 5m fixture: open 100, close 105.
fn nifty_first_bar_derived_values() {
    let series = Series::new("NIFTY", Interval::Minute5);
    let records = normalize(&series, &[raw(at(9, 15), 100.0, 106.0, 99.5, 105.0)]);
    let r = &records[0];
    assert!((r.price_change - 5.0).abs() < f64::EPSILON);
    assert!((r.price_change_pct - 5.0).abs() < f64::EPSILON);
    assert!((r.high_low_range - 6.5).abs() < f64::EPSILON);
    assert!((r.range_pct - 6.53).abs() < 1e-9);
    assert_eq!(r.day_of_week, "Tuesday");
    assert_eq!((r.month, r.year), (1, 2024));
}

#[test]
/// A zero open yields a zero percentage instead of NaN or infinity.
fn zero_open_is_guarded() {
    let series = Series::new("NIFTY", Interval::Minute5);
    let records = normalize(&series, &[raw(at(9, 15), 0.0, 3.0, 0.0, 2.0)]);
    let r = &records[0];
    assert_eq!(r.price_change_pct, 0.0);
    assert_eq!(r.range_pct, 0.0);
    assert!((r.price_change - 2.0).abs() < f64::EPSILON);
    assert!(r.price_change_pct.is_finite());
}

#[test]
/// Timestamps that step backwards are a validation failure naming both bars.
fn out_of_order_batch_is_rejected() {
    let series = Series::new("NIFTY", Interval::Minute5);
    let bars = vec![
        raw(at(9, 20), 1.0, 1.0, 1.0, 1.0),
        raw(at(9, 15), 1.0, 1.0, 1.0, 1.0),
    ];
    match validate_order(&series, &bars) {
        Err(AppError::OutOfOrder {
            series: s,
            previous,
            timestamp,
        }) => {
            assert_eq!(s, "NIFTY@5minute");
            assert_eq!(previous, at(9, 20));
            assert_eq!(timestamp, at(9, 15));
        }
        other => panic!("expected OutOfOrder, got {:?}", other),
    }
    assert!(validate_order(&series, &bars[..1]).is_ok());
    assert!(validate_order(&series, &[]).is_ok());
}
