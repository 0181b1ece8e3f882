use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FetchError, FetchErrorKind};
use crate::model::RawBar;

/// Every Kite JSON response is wrapped in `{status, data}` or `{status, message, error_type}`.
#[derive(Debug, Deserialize)]
pub struct KiteEnvelope<T> {
    pub status: String,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalData {
    #[serde(default)]
    pub candles: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One row of the `/instruments/{exchange}` CSV dump. Unlisted columns are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentRow {
    pub instrument_token: u64,
    pub tradingsymbol: String,
    #[serde(default)]
    pub name: String,
    /// `YYYY-MM-DD` for derivatives, empty otherwise.
    #[serde(default)]
    pub expiry: String,
    #[serde(default)]
    pub strike: f64,
    #[serde(default)]
    pub lot_size: u32,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub segment: String,
    #[serde(default)]
    pub exchange: String,
}

/// One entry of the `/quote` response map, keyed by `EXCHANGE:TRADINGSYMBOL`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub instrument_token: u64,
    pub last_price: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub oi: f64,
    #[serde(default)]
    pub net_change: f64,
    #[serde(default)]
    pub ohlc: QuoteOhlc,
    #[serde(default)]
    pub depth: Option<QuoteDepth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteOhlc {
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub close: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteDepth {
    #[serde(default)]
    pub buy: Vec<DepthLevel>,
    #[serde(default)]
    pub sell: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepthLevel {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: f64,
}

impl DepthLevel {
    /// Kite pads empty books with zero levels.
    pub fn is_empty(&self) -> bool {
        self.quantity <= 0.0 || self.price <= 0.0
    }
}

/// Non-negative whole count from an API number.
pub fn count_from(v: f64) -> u64 {
    if v.is_finite() {
        v.max(0.0).round() as u64
    } else {
        0
    }
}

/// Token cache written by the login helper: `{"access_token", "api_key", "timestamp"}`.
#[derive(Debug, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// A resolved tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub token: u64,
    pub tradingsymbol: String,
    pub name: String,
}

impl From<&InstrumentRow> for Instrument {
    fn from(row: &InstrumentRow) -> Self {
        Self {
            token: row.instrument_token,
            tradingsymbol: row.tradingsymbol.clone(),
            name: row.name.clone(),
        }
    }
}

fn parse_kite_timestamp(s: &str) -> Result<NaiveDateTime, FetchError> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| FetchError::new(FetchErrorKind::Decode, format!("invalid timestamp '{}': {}", s, e)))
}

fn number_at(row: &[Value], idx: usize, field: &str) -> Result<f64, FetchError> {
    row.get(idx)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            FetchError::new(
                FetchErrorKind::Decode,
                format!("candle field '{}' missing or not numeric", field),
            )
        })
}

/// `[timestamp, open, high, low, close, volume, (oi)]`, timestamp kept in exchange-local time.
pub fn parse_candle(row: &[Value]) -> Result<RawBar, FetchError> {
    let ts = row
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::new(FetchErrorKind::Decode, "candle timestamp missing"))?;
    let volume = number_at(row, 5, "volume")?;
    Ok(RawBar {
        timestamp: parse_kite_timestamp(ts)?,
        open: number_at(row, 1, "open")?,
        high: number_at(row, 2, "high")?,
        low: number_at(row, 3, "low")?,
        close: number_at(row, 4, "close")?,
        volume: count_from(volume),
    })
}

/// Map an HTTP status and Kite `error_type` to a fetch error kind.
pub fn classify_error(status: u16, error_type: Option<&str>) -> FetchErrorKind {
    match error_type {
        Some("TokenException") | Some("PermissionException") => return FetchErrorKind::Auth,
        Some("InputException") => return FetchErrorKind::InvalidRequest,
        Some("NetworkException") | Some("GeneralException") | Some("DataException") => {
            return FetchErrorKind::Server
        }
        _ => {}
    }
    match status {
        429 => FetchErrorKind::RateLimited,
        401 | 403 => FetchErrorKind::Auth,
        404 => FetchErrorKind::NotFound,
        400..=499 => FetchErrorKind::InvalidRequest,
        _ => FetchErrorKind::Server,
    }
}

/// Well-known index tokens, used before falling back to the instruments dump.
pub fn known_index(clean_symbol: &str) -> Option<Instrument> {
    let (token, tradingsymbol) = match clean_symbol {
        "nifty" => (256265, "NIFTY 50"),
        "banknifty" => (260105, "NIFTY BANK"),
        "indiavix" => (264969, "INDIA VIX"),
        _ => return None,
    };
    Some(Instrument {
        token,
        tradingsymbol: tradingsymbol.to_string(),
        name: tradingsymbol.to_string(),
    })
}

/// Exact `tradingsymbol` match first, then a unique case-insensitive partial match.
pub fn search_instrument(rows: &[InstrumentRow], symbol: &str) -> Result<Instrument, FetchError> {
    let wanted = symbol.trim().to_ascii_uppercase();
    if let Some(row) = rows.iter().find(|r| r.tradingsymbol == wanted) {
        return Ok(row.into());
    }

    let needle = wanted.to_ascii_lowercase();
    let matches: Vec<&InstrumentRow> = rows
        .iter()
        .filter(|r| r.tradingsymbol.to_ascii_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [only] => Ok((*only).into()),
        [] => Err(FetchError::new(
            FetchErrorKind::NotFound,
            format!("no instrument matches '{}'", wanted),
        )),
        many => {
            let shown: Vec<&str> = many
                .iter()
                .take(5)
                .map(|r| r.tradingsymbol.as_str())
                .collect();
            Err(FetchError::new(
                FetchErrorKind::InvalidRequest,
                format!(
                    "'{}' is ambiguous ({} matches, e.g. {})",
                    wanted,
                    many.len(),
                    shown.join(", ")
                ),
            ))
        }
    }
}
