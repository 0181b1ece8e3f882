use std::fmt;

use super::interval::Interval;

/// Identity of one persisted bar series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Series {
    pub symbol: String,
    pub interval: Interval,
}

impl Series {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_uppercase(),
            interval,
        }
    }

    pub fn table_name(&self) -> String {
        table_name(&self.symbol, self.interval)
    }

    pub fn csv_file_name(&self, days: u32) -> String {
        csv_file_name(&self.symbol, days, self.interval)
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Lowercase alphanumeric form of a trading symbol, with index aliases folded
/// ("NIFTY 50" -> "nifty", "NIFTY BANK" -> "banknifty").
pub fn clean_symbol(symbol: &str) -> String {
    let cleaned: String = symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match cleaned.as_str() {
        "nifty50" => "nifty".to_string(),
        "niftybank" => "banknifty".to_string(),
        _ => cleaned,
    }
}

pub fn table_name(symbol: &str, interval: Interval) -> String {
    format!("{}_{}", clean_symbol(symbol), interval.table_suffix())
}

pub fn csv_file_name(symbol: &str, days: u32, interval: Interval) -> String {
    format!(
        "{}_{}days_{}.csv",
        clean_symbol(symbol),
        days,
        interval.kite_name()
    )
}
