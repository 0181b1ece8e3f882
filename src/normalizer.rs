//! Raw bar → `BarRecord` conversion and series order validation.

use crate::error::AppError;
use crate::model::bar::calendar_fields;
use crate::model::{BarRecord, RawBar, Series};

/// Derived float columns are stored with two decimals.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `numerator / denominator * 100`, or 0 when the denominator is not a usable divisor.
pub(crate) fn guarded_pct(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator.is_finite() && denominator > 0.0 && numerator.is_finite() {
        Some(numerator / denominator * 100.0)
    } else {
        None
    }
}

pub fn normalize_bar(series: &Series, bar: &RawBar) -> BarRecord {
    let price_change = bar.close - bar.open;
    let high_low_range = bar.high - bar.low;

    let price_change_pct = guarded_pct(price_change, bar.open).unwrap_or_else(|| {
        tracing::warn!(
            series = %series,
            timestamp = %bar.timestamp,
            open = bar.open,
            "Non-positive open, price_change_pct set to 0"
        );
        0.0
    });
    let range_pct = guarded_pct(high_low_range, bar.low).unwrap_or_else(|| {
        tracing::warn!(
            series = %series,
            timestamp = %bar.timestamp,
            low = bar.low,
            "Non-positive low, range_pct set to 0"
        );
        0.0
    });

    let (day_of_week, month, year) = calendar_fields(&bar.timestamp);
    BarRecord {
        date: bar.timestamp,
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        price_change: round2(price_change),
        price_change_pct: round2(price_change_pct),
        high_low_range: round2(high_low_range),
        range_pct: round2(range_pct),
        day_of_week: day_of_week.to_string(),
        month,
        year,
    }
}

/// One record per input bar, same order.
pub fn normalize(series: &Series, bars: &[RawBar]) -> Vec<BarRecord> {
    bars.iter().map(|bar| normalize_bar(series, bar)).collect()
}

/// Timestamps must be strictly increasing within a series.
pub fn validate_order(series: &Series, bars: &[RawBar]) -> Result<(), AppError> {
    for pair in bars.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(AppError::OutOfOrder {
                series: series.to_string(),
                previous: pair[0].timestamp,
                timestamp: pair[1].timestamp,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Interval;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> RawBar {
        RawBar {
            timestamp: ts(9, 15),
            open,
            high,
            low,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn derived_fields() {
        let series = Series::new("NIFTY", Interval::Minute5);
        let rec = normalize_bar(&series, &bar(200.0, 210.0, 190.0, 199.0));
        assert!((rec.price_change - -1.0).abs() < f64::EPSILON);
        assert!((rec.price_change_pct - -0.5).abs() < f64::EPSILON);
        assert!((rec.high_low_range - 20.0).abs() < f64::EPSILON);
        assert!((rec.range_pct - 10.53).abs() < 1e-9);
        assert_eq!(rec.day_of_week, "Friday");
        assert_eq!(rec.month, 3);
        assert_eq!(rec.year, 2024);
    }

    #[test]
    fn zero_low_guards_range_pct() {
        let series = Series::new("NIFTY", Interval::Minute5);
        let rec = normalize_bar(&series, &bar(1.0, 2.0, 0.0, 1.5));
        assert_eq!(rec.range_pct, 0.0);
        assert!((rec.price_change_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn nan_open_is_guarded() {
        let series = Series::new("NIFTY", Interval::Minute5);
        let rec = normalize_bar(&series, &bar(f64::NAN, 2.0, 1.0, 1.5));
        assert_eq!(rec.price_change_pct, 0.0);
    }

    #[test]
    fn round2_half_away_from_zero() {
        assert_eq!(round2(1.005_000_1), 1.01);
        assert_eq!(round2(-2.345_6), -2.35);
        assert_eq!(round2(3.0), 3.0);
    }

    #[test]
    fn validate_order_rejects_duplicates() {
        let series = Series::new("NIFTY", Interval::Minute5);
        let a = bar(1.0, 1.0, 1.0, 1.0);
        let b = a.clone();
        let err = validate_order(&series, &[a, b]).unwrap_err();
        assert!(matches!(err, AppError::OutOfOrder { .. }));
    }
}
