//! The market data boundary consumed by the pipeline, plus range planning.

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};

use crate::error::{AppError, FetchError};
use crate::model::bar::TIMESTAMP_FORMAT;
use crate::model::{Interval, RawBar, Series};
use crate::normalizer::validate_order;
use crate::retry::RetryPolicy;

/// IST, the exchange clock for NSE/BSE.
pub const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;
/// Calendar days added to every lookback to cover weekends and holidays.
pub const LOOKBACK_BUFFER_DAYS: i64 = 10;

pub fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN)
}

pub fn exchange_now() -> NaiveDateTime {
    Utc::now().naive_utc() + Duration::seconds(i64::from(EXCHANGE_UTC_OFFSET_SECS))
}

/// Inclusive time window for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl FetchRange {
    pub fn new(from: NaiveDateTime, to: NaiveDateTime) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for FetchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.from.format(TIMESTAMP_FORMAT),
            self.to.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Anything that can return ascending raw bars for a symbol.
pub trait MarketDataSource {
    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        range: &FetchRange,
    ) -> Result<Vec<RawBar>, FetchError>;
}

impl<T: MarketDataSource + ?Sized> MarketDataSource for &T {
    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        range: &FetchRange,
    ) -> Result<Vec<RawBar>, FetchError> {
        (**self).fetch(symbol, interval, range)
    }
}

/// Intraday requests made after the close stop at today's close.
pub fn cap_to_market_close(now: NaiveDateTime, interval: Interval) -> NaiveDateTime {
    if interval.is_intraday() && now.time() > market_close() {
        now.date().and_time(market_close())
    } else {
        now
    }
}

/// Window covering the last `days` calendar days up to `now`.
pub fn lookback_range(days: u32, interval: Interval, now: NaiveDateTime) -> FetchRange {
    let to = cap_to_market_close(now, interval);
    let from = now - Duration::days(i64::from(days) + LOOKBACK_BUFFER_DAYS);
    FetchRange::new(from, to)
}

/// Split `range` into consecutive, non-overlapping request windows sized for `interval`.
pub fn plan_chunks(range: &FetchRange, interval: Interval) -> Vec<FetchRange> {
    let chunk = Duration::days(interval.chunk_days());
    if range.to <= range.from || range.to - range.from <= chunk {
        return vec![*range];
    }

    let mut chunks = Vec::new();
    let mut start = range.from;
    while start <= range.to {
        let end = (start + chunk).min(range.to);
        chunks.push(FetchRange::new(start, end));
        if end == range.to {
            break;
        }
        start = end + Duration::seconds(1);
    }
    chunks
}

/// Drop bars stamped after today's close (or in the future) for intraday series.
pub fn drop_after_close(bars: Vec<RawBar>, interval: Interval, now: NaiveDateTime) -> Vec<RawBar> {
    if !interval.is_intraday() {
        return bars;
    }
    let today = now.date();
    let close_today = today.and_time(market_close());
    let before = bars.len();
    let kept: Vec<RawBar> = bars
        .into_iter()
        .filter(|b| b.timestamp.date() < today || b.timestamp <= close_today)
        .collect();
    if kept.len() < before {
        tracing::info!(
            dropped = before - kept.len(),
            "Filtered bars stamped after market close"
        );
    }
    kept
}

/// Append one chunk, skipping leading bars already covered by the previous chunk.
///
/// Day candles are stamped at midnight, so two adjacent chunks that both touch
/// a date each return that date's candle.
fn append_chunk(bars: &mut Vec<RawBar>, part: Vec<RawBar>) {
    let skip = match bars.last() {
        Some(last) => part
            .iter()
            .take_while(|b| b.timestamp <= last.timestamp)
            .count(),
        None => 0,
    };
    if skip > 0 {
        tracing::debug!(skipped = skip, "Dropped bars repeated at chunk boundary");
    }
    bars.extend(part.into_iter().skip(skip));
}

/// Fetch a whole range chunk by chunk through `policy`, then check ordering.
///
/// A final error whose kind is in `policy.retry_on` is reported as transient,
/// even when retries are disabled.
pub fn fetch_series<S: MarketDataSource + ?Sized>(
    source: &S,
    policy: &RetryPolicy,
    series: &Series,
    range: &FetchRange,
    chunk_pause: StdDuration,
) -> Result<Vec<RawBar>, AppError> {
    let chunks = plan_chunks(range, series.interval);
    let mut bars = Vec::new();

    for (idx, chunk) in chunks.iter().enumerate() {
        if idx > 0 && !chunk_pause.is_zero() {
            std::thread::sleep(chunk_pause);
        }
        let outcome = policy.run(|_| source.fetch(&series.symbol, series.interval, chunk));
        match outcome.result {
            Ok(part) => {
                tracing::info!(
                    series = %series,
                    chunk = idx + 1,
                    chunks = chunks.len(),
                    range = %chunk,
                    count = part.len(),
                    "Fetched chunk"
                );
                append_chunk(&mut bars, part);
            }
            Err(e) if policy.is_transient(&e) => {
                return Err(AppError::TransientFetch {
                    series: series.to_string(),
                    range: chunk.to_string(),
                    attempts: outcome.attempts,
                    source: e,
                });
            }
            Err(e) => {
                return Err(AppError::PermanentFetch {
                    series: series.to_string(),
                    range: chunk.to_string(),
                    source: e,
                });
            }
        }
    }

    validate_order(series, &bars)?;
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn cap_only_applies_after_close_for_intraday() {
        assert_eq!(cap_to_market_close(at(10, 16, 0), Interval::Minute5), at(10, 15, 30));
        assert_eq!(cap_to_market_close(at(10, 11, 0), Interval::Minute5), at(10, 11, 0));
        assert_eq!(cap_to_market_close(at(10, 16, 0), Interval::Day), at(10, 16, 0));
    }

    #[test]
    fn lookback_adds_buffer_days() {
        let range = lookback_range(5, Interval::Day, at(20, 12, 0));
        assert_eq!(range.from, at(5, 12, 0));
        assert_eq!(range.to, at(20, 12, 0));
    }

    #[test]
    fn short_range_is_single_chunk() {
        let range = FetchRange::new(at(1, 9, 0), at(4, 9, 0));
        assert_eq!(plan_chunks(&range, Interval::Minute), vec![range]);
    }

    #[test]
    fn chunks_are_contiguous_and_cover_range() {
        let range = FetchRange::new(at(1, 0, 0), at(13, 0, 0));
        let chunks = plan_chunks(&range, Interval::Minute);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].from, range.from);
        assert_eq!(chunks[0].to, at(6, 0, 0));
        assert_eq!(chunks[1].from, at(6, 0, 0) + Duration::seconds(1));
        assert_eq!(chunks.last().unwrap().to, range.to);
        for pair in chunks.windows(2) {
            assert!(pair[1].from > pair[0].to);
        }
    }

    #[test]
    fn drop_after_close_keeps_earlier_days() {
        let mk = |ts| RawBar {
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0,
        };
        let bars = vec![mk(at(9, 15, 45)), mk(at(10, 15, 30)), mk(at(10, 15, 35))];
        let kept = drop_after_close(bars.clone(), Interval::Minute5, at(10, 16, 0));
        assert_eq!(kept.len(), 2);
        assert_eq!(drop_after_close(bars, Interval::Day, at(10, 16, 0)).len(), 3);
    }
}
