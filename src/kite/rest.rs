use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;

use crate::config::{KiteConfig, OptionsConfig};
use crate::error::{FetchError, FetchErrorKind};
use crate::model::bar::TIMESTAMP_FORMAT;
use crate::model::series::clean_symbol;
use crate::model::{Interval, OptionSnapshot, RawBar};
use crate::options::{chain_snapshots, option_contracts, plan_chain, snapshot_time, OptionChainSource};
use crate::source::{FetchRange, MarketDataSource};

use super::types::{
    classify_error, known_index, parse_candle, search_instrument, HistoricalData, Instrument,
    InstrumentRow, KiteEnvelope, Quote, UserProfile,
};

pub struct KiteRestClient {
    http: Client,
    base_url: String,
    exchange: String,
    instrument_cache: Mutex<HashMap<String, Instrument>>,
}

impl KiteRestClient {
    pub fn new(config: &KiteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static("3"));
        let auth = format!("token {}:{}", config.api_key, config.access_token);
        let mut auth = HeaderValue::from_str(&auth).context("access token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build Kite HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            exchange: config.exchange.clone(),
            instrument_cache: Mutex::new(HashMap::new()),
        })
    }

    fn compact_error_body(body: &str) -> String {
        let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.len() > 180 {
            let mut cut = 180;
            while !normalized.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &normalized[..cut])
        } else {
            normalized
        }
    }

    /// Turn a non-2xx response into a classified error, using the Kite envelope when present.
    fn error_from_response(resp: Response, what: &str) -> FetchError {
        let status = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        match serde_json::from_str::<KiteEnvelope<serde_json::Value>>(&body) {
            Ok(env) => FetchError::new(
                classify_error(status, env.error_type.as_deref()),
                format!(
                    "{} returned {}: {}",
                    what,
                    status,
                    env.message.unwrap_or_default()
                ),
            ),
            Err(_) => FetchError::new(
                classify_error(status, None),
                format!("{} returned {}: {}", what, status, Self::compact_error_body(&body)),
            ),
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send()?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, what));
        }

        let env: KiteEnvelope<T> = resp.json().map_err(|e| {
            FetchError::new(FetchErrorKind::Decode, format!("{} JSON parse failed: {}", what, e))
        })?;
        if env.status != "success" {
            let kind = classify_error(200, env.error_type.as_deref());
            return Err(FetchError::new(
                kind,
                format!("{} failed: {}", what, env.message.unwrap_or_default()),
            ));
        }
        env.data.ok_or_else(|| {
            FetchError::new(FetchErrorKind::Decode, format!("{} returned no data", what))
        })
    }

    /// `GET /user/profile`, used to verify the access token.
    pub fn profile(&self) -> Result<UserProfile, FetchError> {
        self.get_json("/user/profile", &[], "kite profile")
    }

    /// Full instrument list for one exchange (served as CSV).
    pub fn instruments(&self, exchange: &str) -> Result<Vec<InstrumentRow>, FetchError> {
        let url = format!("{}/instruments/{}", self.base_url, exchange);
        let resp = self.http.get(&url).send()?;
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "kite instruments"));
        }
        let body = resp.text()?;
        parse_instruments_csv(&body)
    }

    pub fn resolve(&self, symbol: &str) -> Result<Instrument, FetchError> {
        let key = symbol.trim().to_ascii_uppercase();
        if let Some(found) = known_index(&clean_symbol(&key)) {
            return Ok(found);
        }
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }

        let rows = self.instruments(&self.exchange)?;
        let instrument = search_instrument(&rows, &key)?;
        tracing::info!(
            symbol = %key,
            token = instrument.token,
            tradingsymbol = %instrument.tradingsymbol,
            exchange = %self.exchange,
            "Resolved instrument"
        );
        if let Ok(mut cache) = self.instrument_cache.lock() {
            cache.insert(key, instrument.clone());
        }
        Ok(instrument)
    }

    fn cached(&self, key: &str) -> Option<Instrument> {
        self.instrument_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }

    /// `GET /instruments/historical/{token}/{interval}` for one window.
    pub fn historical(
        &self,
        token: u64,
        interval: Interval,
        range: &FetchRange,
    ) -> Result<Vec<RawBar>, FetchError> {
        let path = format!("/instruments/historical/{}/{}", token, interval.kite_name());
        let query = [
            ("from", range.from.format(TIMESTAMP_FORMAT).to_string()),
            ("to", range.to.format(TIMESTAMP_FORMAT).to_string()),
        ];
        let data: HistoricalData = self.get_json(&path, &query, "kite historical")?;

        let mut bars = Vec::with_capacity(data.candles.len());
        for row in &data.candles {
            bars.push(parse_candle(row)?);
        }
        Ok(bars)
    }
}

impl KiteRestClient {
    /// `GET /quote` for several `EXCHANGE:TRADINGSYMBOL` keys in one call.
    pub fn quotes(&self, keys: &[String]) -> Result<HashMap<String, Quote>, FetchError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let query: Vec<(&str, String)> = keys.iter().map(|k| ("i", k.clone())).collect();
        self.get_json("/quote", &query, "kite quote")
    }

    pub fn last_price(&self, key: &str) -> Result<f64, FetchError> {
        let quotes = self.quotes(&[key.to_string()])?;
        quotes
            .get(key)
            .map(|q| q.last_price)
            .ok_or_else(|| FetchError::new(FetchErrorKind::NotFound, format!("no quote for {}", key)))
    }
}

impl OptionChainSource for KiteRestClient {
    fn option_chain(
        &self,
        cfg: &OptionsConfig,
        now: NaiveDateTime,
    ) -> Result<Vec<OptionSnapshot>, FetchError> {
        let spot = self.last_price(&cfg.spot_instrument)?;
        let rows = self.instruments(&cfg.exchange)?;
        let contracts = option_contracts(&rows, &cfg.underlying);
        tracing::info!(
            underlying = %cfg.underlying,
            contracts = contracts.len(),
            spot,
            "Loaded option contracts"
        );

        let plan = plan_chain(&contracts, spot, now, cfg)?;
        tracing::info!(
            atm = plan.atm,
            expiry = %plan.expiry,
            legs = plan.legs.len(),
            "Option chain planned"
        );
        let quotes = self.quotes(&plan.quote_keys(&cfg.exchange))?;
        Ok(chain_snapshots(
            &plan,
            &cfg.exchange,
            snapshot_time(now, cfg.bucket_minutes),
            &quotes,
        ))
    }
}

impl MarketDataSource for KiteRestClient {
    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        range: &FetchRange,
    ) -> Result<Vec<RawBar>, FetchError> {
        let instrument = self.resolve(symbol)?;
        self.historical(instrument.token, interval, range)
    }
}

pub fn parse_instruments_csv(body: &str) -> Result<Vec<InstrumentRow>, FetchError> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let mut rows = Vec::new();
    for row in reader.deserialize::<InstrumentRow>() {
        let row = row.map_err(|e| {
            FetchError::new(
                FetchErrorKind::Decode,
                format!("instrument dump parse failed: {}", e),
            )
        })?;
        rows.push(row);
    }
    Ok(rows)
}
