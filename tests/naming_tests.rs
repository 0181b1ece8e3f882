use kite_recorder::model::series::{csv_file_name, table_name};
use kite_recorder::model::{parse_interval, Interval, Series};

#[test]
/// Table names are `{clean_symbol}_{suffix}`.
fn table_names_follow_symbol_and_interval() {
    assert_eq!(table_name("NIFTY 50", Interval::Minute), "nifty_1m");
    assert_eq!(table_name("RELIANCE", Interval::Minute5), "reliance_5m");
    assert_eq!(table_name("NIFTY BANK", Interval::Minute15), "banknifty_15m");
    assert_eq!(table_name("M&M", Interval::Hour), "mm_hour");
    assert_eq!(table_name("tcs", Interval::Day), "tcs_day");
}

#[test]
/// CSV names carry the lookback and the upstream interval name.
fn csv_names_follow_symbol_days_and_interval() {
    assert_eq!(
        csv_file_name("NIFTY 50", 30, Interval::Minute5),
        "nifty_30days_5minute.csv"
    );
    assert_eq!(
        csv_file_name("INDIA VIX", 365, Interval::Day),
        "indiavix_365days_day.csv"
    );
    assert_eq!(
        csv_file_name("SBIN", 90, Interval::Hour),
        "sbin_90days_60minute.csv"
    );
}

#[test]
/// Names depend only on the series identity, not on how the symbol was typed.
fn naming_is_deterministic_per_series() {
    let a = Series::new("nifty 50", Interval::Minute3);
    let b = Series::new("  NIFTY 50", Interval::Minute3);
    assert_eq!(a, b);
    assert_eq!(a.table_name(), b.table_name());
    assert_eq!(a.csv_file_name(10), "nifty_10days_3minute.csv");
}

#[test]
/// Every interval round-trips through its upstream name.
fn intervals_parse_from_names_and_short_forms() {
    for interval in Interval::ALL {
        assert_eq!(
            parse_interval(interval.kite_name()).expect("known name"),
            interval
        );
    }
    assert_eq!(parse_interval("5m").expect("short form"), Interval::Minute5);
    assert_eq!(parse_interval(" 1H ").expect("short form"), Interval::Hour);
    assert_eq!("1d".parse::<Interval>().expect("short form"), Interval::Day);
    assert!(parse_interval("2minute").is_err());
    assert!(parse_interval("").is_err());
}

#[test]
/// Only minute data has a short lookback limit.
fn lookback_limits_per_interval() {
    assert_eq!(Interval::Minute.max_days(), 60);
    assert_eq!(Interval::Minute3.max_days(), 200);
    assert_eq!(Interval::Day.max_days(), 2000);
    assert!(Interval::Hour.is_intraday());
    assert!(!Interval::Day.is_intraday());
}
