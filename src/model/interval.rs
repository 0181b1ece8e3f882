use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer};

/// Bar intervals served by the Kite historical API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Minute,
    Minute3,
    Minute5,
    Minute10,
    Minute15,
    Minute30,
    Hour,
    Day,
}

impl Interval {
    pub const ALL: [Interval; 8] = [
        Self::Minute,
        Self::Minute3,
        Self::Minute5,
        Self::Minute10,
        Self::Minute15,
        Self::Minute30,
        Self::Hour,
        Self::Day,
    ];

    /// Name used in the historical endpoint path and in CSV file names.
    pub fn kite_name(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Minute3 => "3minute",
            Self::Minute5 => "5minute",
            Self::Minute10 => "10minute",
            Self::Minute15 => "15minute",
            Self::Minute30 => "30minute",
            Self::Hour => "60minute",
            Self::Day => "day",
        }
    }

    /// Suffix used in database table names (`nifty_5m`, `reliance_day`).
    pub fn table_suffix(self) -> &'static str {
        match self {
            Self::Minute => "1m",
            Self::Minute3 => "3m",
            Self::Minute5 => "5m",
            Self::Minute10 => "10m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Calendar days requested per upstream call.
    pub fn chunk_days(self) -> i64 {
        match self {
            Self::Minute => 5,
            Self::Minute3 | Self::Minute5 | Self::Minute10 | Self::Minute15 => 60,
            Self::Minute30 => 100,
            Self::Hour => 365,
            Self::Day => 2000,
        }
    }

    /// Largest lookback the extractor accepts for this interval.
    pub fn max_days(self) -> u32 {
        match self {
            Self::Minute => 60,
            Self::Minute3 => 200,
            _ => 2000,
        }
    }

    pub fn is_intraday(self) -> bool {
        !matches!(self, Self::Day)
    }
}

/// Parse a Kite interval name ("5minute", "day") or a short form ("5m", "1h", "1d").
pub fn parse_interval(s: &str) -> Result<Interval> {
    let s = s.trim();
    let interval = match s.to_ascii_lowercase().as_str() {
        "minute" | "1minute" | "1m" => Interval::Minute,
        "3minute" | "3m" => Interval::Minute3,
        "5minute" | "5m" => Interval::Minute5,
        "10minute" | "10m" => Interval::Minute10,
        "15minute" | "15m" => Interval::Minute15,
        "30minute" | "30m" => Interval::Minute30,
        "60minute" | "hour" | "1h" | "60m" => Interval::Hour,
        "day" | "1d" => Interval::Day,
        "" => bail!("invalid interval: empty string"),
        _ => bail!(
            "invalid interval '{}': expected one of minute/3minute/5minute/10minute/15minute/30minute/60minute/day",
            s
        ),
    };
    Ok(interval)
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_interval(s)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kite_name())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_interval(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_valid() {
        assert_eq!(parse_interval("minute").unwrap(), Interval::Minute);
        assert_eq!(parse_interval("5minute").unwrap(), Interval::Minute5);
        assert_eq!(parse_interval("5m").unwrap(), Interval::Minute5);
        assert_eq!(parse_interval("hour").unwrap(), Interval::Hour);
        assert_eq!(parse_interval("60minute").unwrap(), Interval::Hour);
        assert_eq!(parse_interval(" 1D ").unwrap(), Interval::Day);
    }

    #[test]
    fn parse_interval_rejects_invalid_inputs() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("m").is_err());
        assert!(parse_interval("2minute").is_err());
        assert!(parse_interval("1w").is_err());
    }

    #[test]
    fn kite_name_round_trips() {
        for interval in Interval::ALL {
            assert_eq!(parse_interval(interval.kite_name()).unwrap(), interval);
        }
    }

    #[test]
    fn table_suffixes() {
        assert_eq!(Interval::Minute.table_suffix(), "1m");
        assert_eq!(Interval::Minute5.table_suffix(), "5m");
        assert_eq!(Interval::Hour.table_suffix(), "hour");
        assert_eq!(Interval::Day.table_suffix(), "day");
    }

    #[test]
    fn only_day_is_not_intraday() {
        let intraday: Vec<_> = Interval::ALL.iter().filter(|i| i.is_intraday()).collect();
        assert_eq!(intraday.len(), 7);
        assert!(!Interval::Day.is_intraday());
    }
}
