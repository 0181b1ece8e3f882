use std::fmt;
use std::num::TryFromIntError;

use chrono::{NaiveDate, NaiveDateTime};

/// Column set of the option snapshot table.
pub const OPTION_COLUMNS: [&str; 20] = [
    "timestamp",
    "spot_price",
    "strike",
    "option_type",
    "expiry_date",
    "moneyness",
    "tradingsymbol",
    "open",
    "high",
    "low",
    "close",
    "last_price",
    "volume",
    "oi",
    "bid_price",
    "ask_price",
    "bid_qty",
    "ask_qty",
    "change",
    "change_pct",
];

/// Key columns: one row per strike, side and expiry at each snapshot time.
pub const OPTION_KEY: [&str; 4] = ["timestamp", "strike", "option_type", "expiry_date"];

pub const EXPIRY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Exchange code, as used in `instrument_type`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "CE" => Some(Self::Call),
            "PE" => Some(Self::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Where a strike sits relative to spot, counted in strike steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moneyness {
    AtTheMoney,
    InTheMoney(u32),
    OutOfTheMoney(u32),
}

impl fmt::Display for Moneyness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtTheMoney => f.write_str("ATM"),
            Self::InTheMoney(n) => write!(f, "ITM_{}", n),
            Self::OutOfTheMoney(n) => write!(f, "OTM_{}", n),
        }
    }
}

/// A listed option from the derivatives instrument dump.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionContract {
    pub token: u64,
    pub tradingsymbol: String,
    pub strike: u32,
    pub option_type: OptionType,
    pub expiry: NaiveDate,
    pub lot_size: u32,
}

/// One quoted strike at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSnapshot {
    pub timestamp: NaiveDateTime,
    pub spot_price: f64,
    pub strike: u32,
    pub option_type: OptionType,
    pub expiry_date: NaiveDate,
    pub moneyness: String,
    pub tradingsymbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    /// Previous session close as reported by the quote.
    pub close: f64,
    pub last_price: f64,
    pub volume: u64,
    pub oi: u64,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub bid_qty: Option<u64>,
    pub ask_qty: Option<u64>,
    pub change: f64,
    pub change_pct: f64,
}

impl OptionSnapshot {
    pub fn key(&self) -> (NaiveDateTime, u32, OptionType, NaiveDate) {
        (self.timestamp, self.strike, self.option_type, self.expiry_date)
    }

    pub fn volume_i64(&self) -> Result<i64, TryFromIntError> {
        i64::try_from(self.volume)
    }

    pub fn oi_i64(&self) -> Result<i64, TryFromIntError> {
        i64::try_from(self.oi)
    }

    pub fn bid_qty_i64(&self) -> Result<Option<i64>, TryFromIntError> {
        self.bid_qty.map(i64::try_from).transpose()
    }

    pub fn ask_qty_i64(&self) -> Result<Option<i64>, TryFromIntError> {
        self.ask_qty.map(i64::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_codes_round_trip() {
        assert_eq!(OptionType::from_code("CE"), Some(OptionType::Call));
        assert_eq!(OptionType::from_code(" PE"), Some(OptionType::Put));
        assert_eq!(OptionType::from_code("FUT"), None);
        assert_eq!(OptionType::Put.to_string(), "PE");
    }

    #[test]
    fn moneyness_labels() {
        assert_eq!(Moneyness::AtTheMoney.to_string(), "ATM");
        assert_eq!(Moneyness::InTheMoney(1).to_string(), "ITM_1");
        assert_eq!(Moneyness::OutOfTheMoney(2).to_string(), "OTM_2");
    }

    #[test]
    fn key_columns_are_part_of_the_table() {
        assert!(OPTION_KEY.iter().all(|k| OPTION_COLUMNS.contains(k)));
    }
}
