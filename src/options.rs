//! Option-chain snapshots: pick the current expiry and the strikes around spot,
//! then turn quotes into rows for the snapshot table.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::config::OptionsConfig;
use crate::error::{FetchError, FetchErrorKind};
use crate::kite::types::{count_from, InstrumentRow, Quote};
use crate::model::option::EXPIRY_FORMAT;
use crate::model::{Moneyness, OptionContract, OptionSnapshot, OptionType};
use crate::normalizer::{guarded_pct, round2};
use crate::source::market_close;

/// Anything that can take a snapshot of the configured option chain.
pub trait OptionChainSource {
    fn option_chain(
        &self,
        cfg: &OptionsConfig,
        now: NaiveDateTime,
    ) -> Result<Vec<OptionSnapshot>, FetchError>;
}

impl<T: OptionChainSource + ?Sized> OptionChainSource for &T {
    fn option_chain(
        &self,
        cfg: &OptionsConfig,
        now: NaiveDateTime,
    ) -> Result<Vec<OptionSnapshot>, FetchError> {
        (**self).option_chain(cfg, now)
    }
}

/// Listed calls and puts on `underlying`. Rows that are not options are skipped.
pub fn option_contracts(rows: &[InstrumentRow], underlying: &str) -> Vec<OptionContract> {
    rows.iter()
        .filter(|r| r.name == underlying && r.segment.ends_with("-OPT"))
        .filter_map(|r| {
            let option_type = OptionType::from_code(&r.instrument_type)?;
            let expiry = NaiveDate::parse_from_str(&r.expiry, EXPIRY_FORMAT).ok()?;
            if !r.strike.is_finite() || r.strike <= 0.0 || r.strike > f64::from(u32::MAX) {
                return None;
            }
            Some(OptionContract {
                token: r.instrument_token,
                tradingsymbol: r.tradingsymbol.clone(),
                strike: r.strike.round() as u32,
                option_type,
                expiry,
                lot_size: r.lot_size,
            })
        })
        .collect()
}

/// Nearest listed expiry still trading at `now`. An expiry day rolls to the
/// next one once the market has closed.
pub fn current_expiry(contracts: &[OptionContract], now: NaiveDateTime) -> Option<NaiveDate> {
    let today = now.date();
    let after_close = now.time() > market_close();
    contracts
        .iter()
        .map(|c| c.expiry)
        .filter(|e| *e > today || (*e == today && !after_close))
        .min()
}

/// Spot rounded to the nearest strike step.
pub fn atm_strike(spot: f64, step: u32) -> Option<u32> {
    if !spot.is_finite() || spot <= 0.0 || step == 0 {
        return None;
    }
    let steps = (spot / f64::from(step)).round();
    if steps > f64::from(u32::MAX / step) {
        return None;
    }
    Some(steps as u32 * step)
}

/// ATM plus `each_side` strikes above and below, for calls then puts.
/// Calls are in the money below spot, puts above it.
pub fn strike_ladder(atm: u32, step: u32, each_side: u32) -> Vec<(OptionType, u32, Moneyness)> {
    let mut out = Vec::new();
    for option_type in [OptionType::Call, OptionType::Put] {
        out.push((option_type, atm, Moneyness::AtTheMoney));
        let below = |k: u32| {
            k.checked_mul(step)
                .and_then(|d| atm.checked_sub(d))
                .filter(|s| *s > 0)
        };
        let above = |k: u32| k.checked_mul(step).and_then(|d| atm.checked_add(d));
        for k in 1..=each_side {
            let itm = match option_type {
                OptionType::Call => below(k),
                OptionType::Put => above(k),
            };
            if let Some(strike) = itm {
                out.push((option_type, strike, Moneyness::InTheMoney(k)));
            }
        }
        for k in 1..=each_side {
            let otm = match option_type {
                OptionType::Call => above(k),
                OptionType::Put => below(k),
            };
            if let Some(strike) = otm {
                out.push((option_type, strike, Moneyness::OutOfTheMoney(k)));
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainLeg {
    pub contract: OptionContract,
    pub moneyness: Moneyness,
}

/// The contracts to quote for one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainPlan {
    pub spot: f64,
    pub atm: u32,
    pub expiry: NaiveDate,
    pub legs: Vec<ChainLeg>,
}

impl ChainPlan {
    pub fn quote_keys(&self, exchange: &str) -> Vec<String> {
        self.legs
            .iter()
            .map(|l| quote_key(exchange, &l.contract.tradingsymbol))
            .collect()
    }
}

pub fn quote_key(exchange: &str, tradingsymbol: &str) -> String {
    format!("{}:{}", exchange, tradingsymbol)
}

pub fn plan_chain(
    contracts: &[OptionContract],
    spot: f64,
    now: NaiveDateTime,
    cfg: &OptionsConfig,
) -> Result<ChainPlan, FetchError> {
    let expiry = current_expiry(contracts, now).ok_or_else(|| {
        FetchError::new(
            FetchErrorKind::NotFound,
            format!("no {} options expire on or after {}", cfg.underlying, now.date()),
        )
    })?;
    let atm = atm_strike(spot, cfg.strike_step).ok_or_else(|| {
        FetchError::new(
            FetchErrorKind::Decode,
            format!("spot price {} is not usable", spot),
        )
    })?;

    let mut legs = Vec::new();
    for (option_type, strike, moneyness) in
        strike_ladder(atm, cfg.strike_step, cfg.strikes_each_side)
    {
        let found = contracts.iter().find(|c| {
            c.expiry == expiry && c.option_type == option_type && c.strike == strike
        });
        match found {
            Some(contract) => legs.push(ChainLeg {
                contract: contract.clone(),
                moneyness,
            }),
            None => tracing::warn!(
                %option_type,
                strike,
                %expiry,
                "Option contract not listed"
            ),
        }
    }
    if legs.is_empty() {
        return Err(FetchError::new(
            FetchErrorKind::NotFound,
            format!(
                "no {} strikes around {} listed for {}",
                cfg.underlying, atm, expiry
            ),
        ));
    }
    Ok(ChainPlan {
        spot,
        atm,
        expiry,
        legs,
    })
}

/// `now` floored to a multiple of `minutes`, seconds cleared.
pub fn snapshot_time(now: NaiveDateTime, minutes: u32) -> NaiveDateTime {
    let minutes = minutes.max(1);
    let day_minutes = now.hour() * 60 + now.minute();
    let floored = day_minutes - day_minutes % minutes;
    now.date().and_time(chrono::NaiveTime::MIN) + Duration::minutes(i64::from(floored))
}

fn positive_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        fallback
    }
}

/// Rows for every leg with a positive last price. Legs without a quote are logged and skipped.
pub fn chain_snapshots(
    plan: &ChainPlan,
    exchange: &str,
    timestamp: NaiveDateTime,
    quotes: &HashMap<String, Quote>,
) -> Vec<OptionSnapshot> {
    let mut out = Vec::with_capacity(plan.legs.len());
    for leg in &plan.legs {
        let c = &leg.contract;
        let key = quote_key(exchange, &c.tradingsymbol);
        let Some(q) = quotes.get(&key) else {
            tracing::warn!(instrument = %key, "No quote returned");
            continue;
        };
        if !(q.last_price.is_finite() && q.last_price > 0.0) {
            tracing::warn!(instrument = %key, "No valid price");
            continue;
        }
        let ltp = q.last_price;
        let (bid, ask) = match &q.depth {
            Some(depth) => (
                depth.buy.first().filter(|l| !l.is_empty()),
                depth.sell.first().filter(|l| !l.is_empty()),
            ),
            None => (None, None),
        };
        let prev_close = positive_or(q.ohlc.close, ltp);
        out.push(OptionSnapshot {
            timestamp,
            spot_price: plan.spot,
            strike: c.strike,
            option_type: c.option_type,
            expiry_date: c.expiry,
            moneyness: leg.moneyness.to_string(),
            tradingsymbol: c.tradingsymbol.clone(),
            open: positive_or(q.ohlc.open, ltp),
            high: positive_or(q.ohlc.high, ltp),
            low: positive_or(q.ohlc.low, ltp),
            close: prev_close,
            last_price: ltp,
            volume: count_from(q.volume),
            oi: count_from(q.oi),
            bid_price: bid.map(|l| l.price),
            ask_price: ask.map(|l| l.price),
            bid_qty: bid.map(|l| count_from(l.quantity)),
            ask_qty: ask.map(|l| count_from(l.quantity)),
            change: round2(q.net_change),
            change_pct: guarded_pct(q.net_change, prev_close).map(round2).unwrap_or(0.0),
        });
    }
    out
}
