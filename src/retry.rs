//! Bounded retry with backoff for calls across the market data boundary.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{FetchError, FetchErrorKind};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally with +/- 50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let seconds = base.as_secs_f64() * factor.powi(attempt as i32);
                let delay = Duration::from_secs_f64(seconds.min(max.as_secs_f64()));
                if !jitter {
                    return delay;
                }
                let half_ms = (delay.as_millis() as f64 * 0.5) as u64;
                let offset = fastrand::u64(0..=(half_ms * 2));
                let total_ms = delay.as_millis() as i64 + offset as i64 - half_ms as i64;
                Duration::from_millis(total_ms.max(0) as u64)
            }
        }
    }
}

/// Which fetch failures to retry, how often, and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on: Vec<FetchErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on: FetchErrorKind::ALL
                .into_iter()
                .filter(|k| k.is_transient())
                .collect(),
        }
    }
}

/// The outcome of a retried call plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, FetchError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether `err` belongs to the configured retryable kinds. Independent of `enabled`.
    pub fn is_transient(&self, err: &FetchError) -> bool {
        self.retry_on.contains(&err.kind)
    }

    pub fn should_retry(&self, err: &FetchError) -> bool {
        self.enabled && self.is_transient(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 0-based attempt number.
    pub fn run<T, F>(&self, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<T, FetchError>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => {
                    return Attempted {
                        result: Ok(v),
                        attempts: attempt + 1,
                    }
                }
                Err(e) if self.should_retry(&e) && attempt < self.max_retries => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying fetch"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt + 1,
                    }
                }
            }
        }
    }
}

/// `[retry]` table in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retry_on: Vec<FetchErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            enabled: policy.enabled,
            max_retries: policy.max_retries,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: true,
            retry_on: policy.retry_on,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.enabled,
            max_retries: if self.enabled { self.max_retries } else { 0 },
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.base_delay_ms),
                factor: 2.0,
                max: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
                jitter: self.jitter,
            },
            retry_on: self.retry_on.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(Duration::ZERO, max_retries)
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..20 {
            let ms = backoff.delay(1).as_millis();
            assert!((100..=300).contains(&ms), "delay {}ms", ms);
        }
    }

    #[test]
    fn retries_transient_then_succeeds() {
        let policy = instant_policy(3);
        let out = policy.run(|attempt| {
            if attempt < 2 {
                Err(FetchError::new(FetchErrorKind::Network, "reset"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(out.result.unwrap(), 2);
        assert_eq!(out.attempts, 3);
    }

    #[test]
    fn permanent_error_is_not_retried() {
        let policy = instant_policy(3);
        let mut calls = 0;
        let out: Attempted<()> = policy.run(|_| {
            calls += 1;
            Err(FetchError::new(FetchErrorKind::InvalidRequest, "bad symbol"))
        });
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = instant_policy(2);
        let out: Attempted<()> =
            policy.run(|_| Err(FetchError::new(FetchErrorKind::Server, "502")));
        assert_eq!(out.attempts, 3);
        assert_eq!(out.result.unwrap_err().kind, FetchErrorKind::Server);
    }

    #[test]
    fn disabled_policy_makes_one_attempt() {
        let out: Attempted<()> = RetryPolicy::disabled()
            .run(|_| Err(FetchError::new(FetchErrorKind::Network, "timeout")));
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn retry_on_list_filters_kinds() {
        let policy = RetryPolicy {
            retry_on: vec![FetchErrorKind::RateLimited],
            ..instant_policy(5)
        };
        assert!(policy.should_retry(&FetchError::new(FetchErrorKind::RateLimited, "429")));
        assert!(!policy.should_retry(&FetchError::new(FetchErrorKind::Auth, "token")));
    }

    #[test]
    fn transient_follows_retry_on_even_when_disabled() {
        let policy = RetryPolicy {
            retry_on: vec![FetchErrorKind::RateLimited],
            ..RetryPolicy::disabled()
        };
        assert!(policy.is_transient(&FetchError::new(FetchErrorKind::RateLimited, "429")));
        assert!(!policy.is_transient(&FetchError::new(FetchErrorKind::Network, "reset")));
        assert!(!policy.should_retry(&FetchError::new(FetchErrorKind::RateLimited, "429")));
        assert_eq!(RetryPolicy::default().retry_on.len(), 4);
    }

    #[test]
    fn config_builds_policy() {
        let cfg = RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        };
        let policy = cfg.policy();
        assert!(!policy.enabled);
        assert_eq!(policy.max_retries, 0);
    }
}
