use std::num::TryFromIntError;

use chrono::{Datelike, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};

/// Column order shared by the CSV header and the SQL tables.
pub const COLUMNS: [&str; 13] = [
    "date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "price_change",
    "price_change_pct",
    "high_low_range",
    "range_pct",
    "day_of_week",
    "month",
    "year",
];

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One OHLCV bar as returned by the market data API, in exchange-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl RawBar {
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// High/low bracket open and close. Upstream data is expected to satisfy this.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }
}

/// A normalized bar with the derived columns persisted by every sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    #[serde(with = "timestamp_format")]
    pub date: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub price_change: f64,
    pub price_change_pct: f64,
    pub high_low_range: f64,
    pub range_pct: f64,
    pub day_of_week: String,
    pub month: u32,
    pub year: i32,
}

impl BarRecord {
    pub fn month_i32(&self) -> Result<i32, TryFromIntError> {
        i32::try_from(self.month)
    }

    /// Volume as a signed SQL integer. Fails above `i64::MAX`.
    pub fn volume_i64(&self) -> Result<i64, TryFromIntError> {
        i64::try_from(self.volume)
    }

    pub fn raw(&self) -> RawBar {
        RawBar {
            timestamp: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

pub fn day_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn calendar_fields(ts: &NaiveDateTime) -> (&'static str, u32, i32) {
    (day_name(ts.weekday()), ts.month(), ts.year())
}

pub mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Accepts the canonical format and the ISO `T` separator.
    pub fn parse(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        let s = s.trim();
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn consistency_check() {
        let bar = RawBar {
            timestamp: ts(9, 15),
            open: 100.0,
            high: 106.0,
            low: 99.0,
            close: 105.0,
            volume: 10,
        };
        assert!(bar.is_consistent());
        assert!(bar.is_bullish());

        let broken = RawBar { high: 104.0, ..bar };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn sql_integer_conversions_reject_overflow() {
        let raw = RawBar {
            timestamp: ts(9, 15),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: u64::MAX,
        };
        let record = BarRecord {
            date: raw.timestamp,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            price_change: 0.0,
            price_change_pct: 0.0,
            high_low_range: 0.0,
            range_pct: 0.0,
            day_of_week: "Tuesday".to_string(),
            month: 1,
            year: 2024,
        };
        assert!(record.volume_i64().is_err());
        assert_eq!(record.month_i32().unwrap(), 1);
        let fits = BarRecord {
            volume: 42,
            ..record
        };
        assert_eq!(fits.volume_i64().unwrap(), 42);
    }

    #[test]
    fn calendar_fields_use_full_day_names() {
        assert_eq!(calendar_fields(&ts(9, 15)), ("Tuesday", 1, 2024));
    }

    #[test]
    fn timestamp_parse_accepts_both_separators() {
        assert_eq!(
            timestamp_format::parse("2024-01-02 09:15:00").unwrap(),
            ts(9, 15)
        );
        assert_eq!(
            timestamp_format::parse("2024-01-02T09:15:00").unwrap(),
            ts(9, 15)
        );
        assert!(timestamp_format::parse("02/01/2024").is_err());
    }
}
