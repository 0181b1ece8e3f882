use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::{NotifierConfig, TelegramConfig};
use crate::model::bar::TIMESTAMP_FORMAT;
use crate::model::{BarRecord, Series};
use crate::normalizer::round2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Bullish,
    LeanBullish,
    Sideways,
    LeanBearish,
    Bearish,
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bullish => "Bullish",
            Self::LeanBullish => "Lean bullish",
            Self::Sideways => "Sideways",
            Self::LeanBearish => "Lean bearish",
            Self::Bearish => "Bearish",
        };
        f.write_str(s)
    }
}

/// Label a net move in points. Moves inside `flat_move_points` are sideways.
pub fn classify_movement(points: f64, cfg: &NotifierConfig) -> Movement {
    if points >= cfg.strong_move_points {
        Movement::Bullish
    } else if points <= -cfg.strong_move_points {
        Movement::Bearish
    } else if points.abs() < cfg.flat_move_points {
        Movement::Sideways
    } else if points > 0.0 {
        Movement::LeanBullish
    } else {
        Movement::LeanBearish
    }
}

/// Markdown summary of one persisted batch.
pub fn summarize(series: &Series, records: &[BarRecord], cfg: &NotifierConfig) -> String {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return format!("*{}* ({})\nNo bars fetched.", series.symbol, series.interval);
    };

    let net = round2(last.close - first.open);
    let net_pct = if first.open > 0.0 {
        round2(net / first.open * 100.0)
    } else {
        0.0
    };
    let high = records.iter().map(|r| r.high).fold(f64::MIN, f64::max);
    let low = records.iter().map(|r| r.low).fold(f64::MAX, f64::min);
    let avg_volume = records.iter().map(|r| r.volume as f64).sum::<f64>() / records.len() as f64;
    let up_bars = records.iter().filter(|r| r.raw().is_bullish()).count();

    format!(
        "*{symbol}* ({interval})\n\
         Bars: {count}\n\
         From: {from}\n\
         To: {to}\n\
         Open: {open:.2}  Close: {close:.2}\n\
         Move: {net:+.2} pts ({net_pct:+.2}%)\n\
         High: {high:.2}  Low: {low:.2}\n\
         Avg volume: {avg_volume:.0}\n\
         Up bars: {up_bars}/{count}\n\
         Signal: {movement}",
        symbol = series.symbol,
        interval = series.interval,
        count = records.len(),
        from = first.date.format(TIMESTAMP_FORMAT),
        to = last.date.format(TIMESTAMP_FORMAT),
        open = first.open,
        close = last.close,
        movement = classify_movement(net, cfg),
    )
}

pub trait Notify {
    fn send(&self, text: &str) -> Result<()>;
}

impl<T: Notify + ?Sized> Notify for &T {
    fn send(&self, text: &str) -> Result<()> {
        (**self).send(text)
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

pub struct TelegramNotifier {
    http: Client,
    endpoint: String,
    chat_ids: Vec<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .context("TELEGRAM_BOT_TOKEN not set")?;
        let chat_ids = config.chat_ids();
        if chat_ids.is_empty() {
            bail!("TELEGRAM_CHAT_ID not set");
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base_url.trim_end_matches('/'),
                token
            ),
            chat_ids,
        })
    }

    fn send_to(&self, chat_id: &str, text: &str) -> Result<()> {
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: "Markdown",
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .with_context(|| format!("telegram send to {} failed", chat_id))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            bail!("telegram send to {} returned {}: {}", chat_id, status, body.trim());
        }
        Ok(())
    }
}

impl Notify for TelegramNotifier {
    /// Deliver to every chat; fails if any delivery failed.
    fn send(&self, text: &str) -> Result<()> {
        let mut failed = Vec::new();
        for chat_id in &self.chat_ids {
            if let Err(e) = self.send_to(chat_id, text) {
                tracing::warn!(chat_id = %chat_id, error = %e, "Telegram delivery failed");
                failed.push(chat_id.as_str());
            }
        }
        if !failed.is_empty() {
            bail!(
                "telegram delivery failed for {}/{} chat(s): {}",
                failed.len(),
                self.chat_ids.len(),
                failed.join(", ")
            );
        }
        tracing::info!(chats = self.chat_ids.len(), "Telegram summary sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_thresholds() {
        let cfg = NotifierConfig::default();
        assert_eq!(classify_movement(80.0, &cfg), Movement::Bullish);
        assert_eq!(classify_movement(50.0, &cfg), Movement::Bullish);
        assert_eq!(classify_movement(30.0, &cfg), Movement::LeanBullish);
        assert_eq!(classify_movement(10.0, &cfg), Movement::Sideways);
        assert_eq!(classify_movement(-24.99, &cfg), Movement::Sideways);
        assert_eq!(classify_movement(-25.0, &cfg), Movement::LeanBearish);
        assert_eq!(classify_movement(-60.0, &cfg), Movement::Bearish);
    }

    #[test]
    fn notifier_requires_token_and_chat() {
        let mut cfg = TelegramConfig::default();
        assert!(TelegramNotifier::new(&cfg).is_err());
        cfg.bot_token = Some("123:abc".to_string());
        assert!(TelegramNotifier::new(&cfg).is_err());
        cfg.chat_id = Some("42".to_string());
        cfg.broadcast_ids = vec!["7".to_string()];
        let notifier = TelegramNotifier::new(&cfg).unwrap();
        assert_eq!(
            notifier.endpoint,
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        assert_eq!(notifier.chat_ids, vec!["42".to_string(), "7".to_string()]);
    }
}
